//! Project verification and IAM SSH keys.

use tracing::info;

use super::types::{CreateSshKeyRequest, SshKey, SshKeysResponse};
use super::{ScalewayBackend, ScalewayBackendError};

impl ScalewayBackend {
    /// Fetches the project, which fails for unknown projects and for
    /// credentials without access to it.
    pub(super) async fn check_project(&self) -> Result<(), ScalewayBackendError> {
        let _project: serde_json::Value = self
            .get(&self.account_url(&format!("projects/{}", self.project)))
            .await?;
        Ok(())
    }

    pub(super) async fn find_ssh_key(
        &self,
        name: &str,
    ) -> Result<Option<SshKey>, ScalewayBackendError> {
        let found: SshKeysResponse = self
            .list(
                &self.iam_url("ssh-keys"),
                &[("name", name), ("project_id", self.project.as_str())],
            )
            .await?;
        Ok(found.ssh_keys.into_iter().find(|key| key.name == name))
    }

    /// Registers `public_key` with the project. Scaleway installs every
    /// project key on servers at boot.
    pub(super) async fn post_ssh_key(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<String, ScalewayBackendError> {
        let created: SshKey = self
            .post(
                &self.iam_url("ssh-keys"),
                &CreateSshKeyRequest {
                    name,
                    public_key: public_key.trim(),
                    project_id: &self.project,
                },
            )
            .await?;
        info!(key = %created.name, key_id = %created.id, "ssh key registered");
        Ok(created.id)
    }
}
