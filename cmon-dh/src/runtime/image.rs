//! Detector image builds

use super::dockerfile;
use super::{BuildOutput, ContainerRuntime, RuntimeError};
use crate::config::RuntimeConfig;
use crate::models::DetectorManifest;
use std::path::Path;
use tracing::info;

/// Build the hardened image for the detector package in `detector_dir`
///
/// **Algorithm:**
/// 1. Fail fast when the engine is unavailable
/// 2. Validate the manifest's base image (pinned tag, allow-listed)
/// 3. Use the package's Dockerfile if present (its `FROM` images must pass
///    the same check), otherwise write the generated hardened definition
/// 4. Build with pull-always semantics
pub async fn build_detector_image(
    runtime: &dyn ContainerRuntime,
    detector_dir: &Path,
    manifest: &DetectorManifest,
    config: &RuntimeConfig,
) -> Result<BuildOutput, RuntimeError> {
    runtime.ensure_available()?;
    dockerfile::validate_base_image(&manifest.docker.base_image, &config.allowed_base_images)?;

    let dockerfile_path = detector_dir.join("Dockerfile");
    if dockerfile_path.is_file() {
        let supplied = tokio::fs::read_to_string(&dockerfile_path).await?;
        let images = dockerfile::from_images(&supplied);
        if images.is_empty() {
            return Err(RuntimeError::InvalidImage(
                "Dockerfile has no FROM instruction".to_string(),
            ));
        }
        for image in &images {
            dockerfile::validate_base_image(image, &config.allowed_base_images)?;
        }
    } else {
        let has_requirements = detector_dir.join("requirements.txt").is_file();
        let rendered = dockerfile::render(manifest, has_requirements);
        tokio::fs::write(&dockerfile_path, rendered).await?;
    }

    let image_ref = manifest.image_ref(&config.image_prefix);
    info!(
        detector = %manifest.name,
        image = %image_ref,
        "Building detector image"
    );
    runtime.build_image(detector_dir, &image_ref).await
}
