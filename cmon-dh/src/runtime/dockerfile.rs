//! Hardened build definitions for detector images

use super::RuntimeError;
use crate::models::DetectorManifest;

/// Non-root uid baked into generated images
pub const DETECTOR_UID: u32 = 10001;

/// Check a base image reference against the allow-list
///
/// The tag must be explicit and must not be `latest`.
pub fn validate_base_image(image: &str, allowed: &[String]) -> Result<(), RuntimeError> {
    let image = image.trim();
    let (repository, tag) = split_tag(image);

    match tag {
        None => {
            return Err(RuntimeError::InvalidImage(format!(
                "Base image '{}' has no tag; pin an explicit version",
                image
            )))
        }
        Some("latest") => {
            return Err(RuntimeError::InvalidImage(format!(
                "Base image '{}' uses the 'latest' tag; pin an explicit version",
                image
            )))
        }
        Some(_) => {}
    }

    if repository.is_empty() || !allowed.iter().any(|a| a == image) {
        return Err(RuntimeError::InvalidImage(format!(
            "Base image '{}' is not allowed (allowed: {})",
            image,
            allowed.join(", ")
        )));
    }
    Ok(())
}

/// Split `repo[:tag][@digest]` into repository and tag
fn split_tag(image: &str) -> (&str, Option<&str>) {
    let without_digest = image.split('@').next().unwrap_or(image);
    // A ':' before the last '/' belongs to a registry port
    let last_slash = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    match without_digest[last_slash..].rfind(':') {
        Some(i) => {
            let split = last_slash + i;
            (&without_digest[..split], Some(&without_digest[split + 1..]))
        }
        None => (without_digest, None),
    }
}

/// Base images named by `FROM` lines of a Dockerfile
pub fn from_images(dockerfile: &str) -> Vec<String> {
    dockerfile
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.get(..5)
                .map(|prefix| prefix.eq_ignore_ascii_case("FROM "))
                .unwrap_or(false)
        })
        .filter_map(|line| {
            line[5..]
                .split_whitespace()
                .find(|token| !token.starts_with("--"))
                .map(str::to_string)
        })
        .collect()
}

/// Render the build definition used when a package ships none
///
/// Pinned base, dependencies installed as root, privilege helpers removed,
/// then everything runs as an unprivileged user.
pub fn render(manifest: &DetectorManifest, has_requirements: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!("FROM {}\n\n", manifest.docker.base_image));
    out.push_str("ENV PYTHONDONTWRITEBYTECODE=1 \\\n    PYTHONUNBUFFERED=1 \\\n    PIP_NO_CACHE_DIR=1\n\n");
    out.push_str(&format!(
        "RUN groupadd --gid {uid} detector && \\\n    useradd --uid {uid} --gid {uid} --no-create-home --shell /usr/sbin/nologin detector\n\n",
        uid = DETECTOR_UID
    ));
    out.push_str("WORKDIR /app\n");
    if has_requirements {
        out.push_str("COPY requirements.txt /app/requirements.txt\n");
        out.push_str("RUN pip install --no-cache-dir -r /app/requirements.txt\n");
    }
    out.push_str("COPY . /app\n\n");
    out.push_str(
        "RUN rm -f /usr/bin/su /bin/su /usr/bin/sudo /usr/bin/passwd && \\\n    chown -R root:root /app && chmod -R a-w /app\n\n",
    );
    out.push_str(&format!("USER {uid}:{uid}\n", uid = DETECTOR_UID));
    out.push_str(&format!(
        "ENTRYPOINT [\"python\", \"-u\", \"/app/{}\"]\n",
        manifest.entry_point
    ));
    out
}
