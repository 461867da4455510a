//! Image label resolution against the public catalogue.

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use tracing::debug;
use uuid::Uuid;

use super::{ScalewayBackend, ScalewayBackendError};

impl ScalewayBackend {
    /// Returns `image` unchanged when it is already an identifier, otherwise
    /// the newest available public image carrying that label.
    pub(super) async fn resolve_image(&self, image: &str) -> Result<String, ScalewayBackendError> {
        if Uuid::parse_str(image).is_ok() {
            return Ok(image.to_owned());
        }
        let images = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &self.zone)
            .public(true)
            .name(image)
            .arch(&self.architecture)
            .run_async()
            .await?;
        let resolved = newest_available(images, &self.architecture).ok_or_else(|| {
            ScalewayBackendError::ImageNotFound {
                label: image.to_owned(),
                arch: self.architecture.clone(),
                zone: self.zone.clone(),
            }
        })?;
        debug!(label = image, image_id = %resolved, "image resolved");
        Ok(resolved)
    }
}

fn newest_available(images: Vec<ScalewayImage>, architecture: &str) -> Option<String> {
    images
        .into_iter()
        .filter(|image| image.arch == architecture && image.state == "available")
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
        ScalewayImage {
            id: id.to_owned(),
            name: String::from("ubuntu_noble"),
            arch: arch.to_owned(),
            creation_date: creation_date.to_owned(),
            modification_date: String::new(),
            from_server: None,
            organization: String::new(),
            public: true,
            state: state.to_owned(),
            project: String::new(),
            tags: vec![],
            zone: String::from("fr-par-1"),
            root_volume: scaleway_rs::ScalewayImageRootVolume {
                id: String::new(),
                name: String::new(),
                size: 0,
                volume_type: String::new(),
            },
            default_bootscript: None,
            extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
                volumes: HashMap::new(),
            },
        }
    }

    #[test]
    fn picks_the_newest_available_image_for_the_architecture() {
        let images = vec![
            image("older", "x86_64", "available", "2025-01-01T00:00:00Z"),
            image("newest", "x86_64", "available", "2025-02-01T00:00:00Z"),
            image("arm", "arm64", "available", "2025-03-01T00:00:00Z"),
            image("broken", "x86_64", "error", "2025-04-01T00:00:00Z"),
        ];

        assert_eq!(
            newest_available(images, "x86_64").as_deref(),
            Some("newest")
        );
    }

    #[test]
    fn no_candidates_yields_none() {
        let images = vec![image("arm", "arm64", "available", "2025-03-01T00:00:00Z")];

        assert_eq!(newest_available(images, "x86_64"), None);
    }
}
