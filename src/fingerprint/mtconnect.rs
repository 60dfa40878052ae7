use crate::domain::{Fingerprint, Protocol};
use crate::fingerprint::ProtocolProbe;
use crate::protocols::mtconnect::parse_identity;
use crate::protocols::ProtocolError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub const MTCONNECT_CONFIDENCE: f64 = 0.95;

/// Paths tried in order; the first document that identifies as MTConnect wins.
const PATHS: [&str; 2] = ["/probe", "/current"];

pub struct MtconnectProbe {
    client: reqwest::Client,
}

impl MtconnectProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProtocolError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("edge-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProtocolProbe for MtconnectProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Mtconnect
    }

    async fn probe(&self, ip: &str, port: u16) -> Result<Option<Fingerprint>, ProtocolError> {
        let base = format!("http://{}:{}", ip, port);
        let mut last_err = None;

        for path in PATHS {
            let url = format!("{}{}", base, path);
            let response = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    // connection-level failures will not improve on the next path
                    if e.is_connect() || e.is_timeout() {
                        return Err(e.into());
                    }
                    last_err = Some(e);
                    continue;
                }
            };
            if response.status().as_u16() != 200 {
                debug!(%url, status = response.status().as_u16(), "MTConnect probe: non-200");
                continue;
            }
            let body = response.text().await?;
            let Some(identity) = parse_identity(&body) else {
                debug!(%url, "MTConnect probe: not an MTConnect document");
                continue;
            };

            let vendor = identity.manufacturer.clone().or_else(|| identity.sender.clone());
            let mut fp = Fingerprint::new(ip, Protocol::Mtconnect, base.clone(), MTCONNECT_CONFIDENCE)
                .with_vendor(vendor)
                .with_model(identity.model.clone())
                .with_serial(identity.serial.clone())
                .with_controller_version(identity.version.clone())
                .with_evidence("root", identity.root.clone())
                .with_evidence("path", path);
            if let Some(sender) = identity.sender {
                fp = fp.with_evidence("sender", sender);
            }
            if let Some(device) = identity.device_name {
                fp = fp.with_evidence("device_name", device);
            }
            return Ok(Some(fp));
        }

        match last_err {
            Some(e) => Err(e.into()),
            None => Ok(None),
        }
    }
}
