//! Durable buffer behaviour across process restarts.

use anyhow::Result;
use edge_gateway::buffer::{BufferStats, DurableBuffer};
use edge_gateway::domain::{EventRecord, OutboundRecord, RecordContext, Severity, TelemetryRecord};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tempfile::tempdir;

fn records(n: usize) -> Vec<OutboundRecord> {
    let ctx = RecordContext { tenant_id: "acme".into(), site_id: "plant-1".into(), device_id: "gw-1".into() };
    (0..n)
        .map(|i| {
            let mut metrics = BTreeMap::new();
            metrics.insert("part_count".to_string(), json!(i));
            TelemetryRecord::new(&ctx, "mazak-1", &format!("2026-03-01T08:00:{:02}.000Z", i), metrics, None).into()
        })
        .collect()
}

#[test]
fn reserved_rows_survive_a_crash() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("buffer.db");
    let all = records(5);
    {
        let buffer = DurableBuffer::open(&path)?;
        assert_eq!(buffer.enqueue_all(&all)?, 5);
        let reserved = buffer.reserve_batch(3)?;
        assert_eq!(reserved.len(), 3);
        assert_eq!(buffer.stats()?, BufferStats { queued: 2, in_flight: 3 });
        // dropped without close(): the process died mid-send
    }

    let buffer = DurableBuffer::open(&path)?;
    assert_eq!(buffer.stats()?, BufferStats { queued: 5, in_flight: 0 });

    let batch = buffer.reserve_batch(10)?;
    let got: BTreeSet<String> = batch.iter().map(|r| r.id.clone()).collect();
    let want: BTreeSet<String> = all.iter().map(|r| r.idempotency_id().to_string()).collect();
    assert_eq!(got, want);
    // the first three were handed out twice
    assert_eq!(batch.iter().filter(|r| r.attempt_count == 2).count(), 3);

    buffer.mark_sent(&batch.iter().map(|r| r.id.clone()).collect::<Vec<_>>())?;
    assert_eq!(buffer.stats()?, BufferStats::default());
    buffer.close()?;
    Ok(())
}

#[test]
fn duplicates_are_ignored_across_restarts() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("buffer.db");
    let ctx = RecordContext { tenant_id: "acme".into(), site_id: "plant-1".into(), device_id: "gw-1".into() };
    let event: OutboundRecord = EventRecord::new(
        &ctx,
        "EDGE_GATEWAY",
        "2026-03-01T08:00:00.000Z",
        "UPDATE_BLOCKED",
        Severity::Critical,
        json!({"driver_id": "haas_mtconnect", "version": "2.0.0", "reason": "signature_mismatch"}),
    )
    .into();

    let buffer = DurableBuffer::open(&path)?;
    assert!(buffer.enqueue(&event)?);
    buffer.close()?;

    let buffer = DurableBuffer::open(&path)?;
    assert!(!buffer.enqueue(&event)?);
    assert_eq!(buffer.stats()?.queued, 1);
    let batch = buffer.reserve_batch(10)?;
    assert_eq!(batch[0].payload["event_type"], "UPDATE_BLOCKED");
    assert_eq!(batch[0].payload["kind"], "event");
    buffer.close()?;
    Ok(())
}

#[test]
fn blocked_updates_in_the_same_millisecond_are_both_kept() -> Result<()> {
    let dir = tempdir()?;
    let ctx = RecordContext { tenant_id: "acme".into(), site_id: "plant-1".into(), device_id: "gw-1".into() };
    let blocked = |driver_id: &str| -> OutboundRecord {
        EventRecord::new(
            &ctx,
            "EDGE_GATEWAY",
            "2026-03-01T08:00:00.000Z",
            "UPDATE_BLOCKED",
            Severity::Critical,
            json!({"driver_id": driver_id, "version": "2.0.0", "reason": "signature_mismatch"}),
        )
        .into()
    };

    let buffer = DurableBuffer::open(dir.path().join("buffer.db"))?;
    assert!(buffer.enqueue(&blocked("haas_mtconnect"))?);
    assert!(buffer.enqueue(&blocked("mazak_mtconnect"))?);
    assert_eq!(buffer.stats()?, BufferStats { queued: 2, in_flight: 0 });
    buffer.close()?;
    Ok(())
}
