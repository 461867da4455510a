//! Read-only queries: state, address and URLs.

use tracing::debug;

use super::HostDriver;
use crate::backend::{Classify, ComputeBackend};
use crate::error::{DriverError, PreconditionError};
use crate::keypair::KeyGenerator;
use crate::state::{CanonicalState, derive_state};

impl<B, K> HostDriver<B, K>
where
    B: ComputeBackend + Send + Sync,
    K: KeyGenerator + Send + Sync,
{
    pub(super) async fn current_state(&self) -> Result<CanonicalState, DriverError<B::Error>> {
        if let Some(instance) = self.lookup_instance().await? {
            return Ok(derive_state(Some(&instance.status), true));
        }
        let volume_present = match self.backend.volume(&self.config.volume_name()).await {
            Ok(found) => found.is_some(),
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(DriverError::Backend(err)),
        };
        Ok(derive_state(None, volume_present))
    }

    pub(super) async fn resolve_ip(&mut self) -> Result<String, DriverError<B::Error>> {
        if let Some(cached) = &self.state.ip {
            return Ok(cached.clone());
        }
        let address = self
            .lookup_instance()
            .await?
            .and_then(|instance| self.address_of(&instance))
            .ok_or_else(|| PreconditionError::HostNotRunning {
                host: self.config.name.clone(),
            })?;
        debug!(host = %self.config.name, address = %address, "caching address");
        self.state.ip = Some(address.clone());
        Ok(address)
    }

    pub(super) async fn control_url(&mut self) -> Result<String, DriverError<B::Error>> {
        let address = self.resolve_ip().await?;
        Ok(control_url(&address, self.config.control_port))
    }
}

fn control_url(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("tcp://[{address}]:{port}")
    } else {
        format!("tcp://{address}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::control_url;
    use rstest::rstest;

    #[rstest]
    #[case("198.51.100.7", "tcp://198.51.100.7:2376")]
    #[case("2001:db8::1", "tcp://[2001:db8::1]:2376")]
    fn control_url_brackets_ipv6(#[case] address: &str, #[case] expected: &str) {
        assert_eq!(control_url(address, 2376), expected);
    }
}
