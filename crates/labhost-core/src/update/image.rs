//! Image names and the URLs derived from them.
//!
//! An image name is a `{build_target}/{version}` path such as
//! `lumpy-release/R27-3837.0.0`. Update URLs carry it after the endpoint
//! segment: `http://devserver:8082/update/lumpy-release/R27-3837.0.0`.

use regex::Regex;

/// Release builds whose stateful partition can be refreshed without
/// rewriting the root filesystem.
const RELEASE_PATTERN: &str = r"^.*-release/R[0-9]+-[0-9]+\.[0-9]+\.0$";

/// Returns true for a canonical release build name.
#[must_use]
pub fn is_release_build(image_name: &str) -> bool {
    Regex::new(RELEASE_PATTERN).is_ok_and(|re| re.is_match(image_name))
}

/// Extracts the image name from an update URL.
///
/// The name is everything after the first path segment, so
/// `http://ds:8082/update/lumpy-release/R27-3837.0.0` yields
/// `lumpy-release/R27-3837.0.0`.
#[must_use]
pub fn url_to_image_name(update_url: &str) -> &str {
    let path = update_url
        .split_once("://")
        .map_or(update_url, |(_, rest)| rest.split_once('/').map_or("", |(_, path)| path));
    path.split_once('/').map_or(path, |(_, image)| image)
}

/// The version component of an image name (`R27-3837.0.0`).
#[must_use]
pub fn image_version(image_name: &str) -> &str {
    image_name.rsplit('/').next().unwrap_or(image_name)
}

/// Returns true if the image `build` is the build reporting
/// `CHROMEOS_RELEASE_VERSION=release_version`.
///
/// The milestone prefix is ignored and a trailing `-rcN`/`-bN` tag is
/// allowed, so `link-paladin/R50-7978.0.0-rc2` matches `7978.0.0`.
#[must_use]
pub fn version_match(build: &str, release_version: &str) -> bool {
    let version = image_version(build);
    let version = version.split_once('-').map_or(version, |(_, rest)| rest);
    !release_version.is_empty()
        && (version == release_version
            || version
                .strip_prefix(release_version)
                .is_some_and(|tag| tag.starts_with('-')))
}

/// Returns true if `image` is already a URL rather than a build name.
#[must_use]
pub fn is_url(image: &str) -> bool {
    image.starts_with("http://") || image.starts_with("https://")
}

/// Formats the stable image name for `board` from a
/// `{board}`/`{version}` pattern.
#[must_use]
pub fn stable_image_name(pattern: &str, board: &str, version: &str) -> String {
    pattern.replace("{board}", board).replace("{version}", version)
}

/// Formats an update URL from a `{devserver}`/`{image}` pattern.
#[must_use]
pub fn update_url(pattern: &str, devserver: &str, image_name: &str) -> String {
    pattern
        .replace("{devserver}", devserver.trim_end_matches('/'))
        .replace("{image}", image_name)
}

/// The devserver static directory serving the same image as `update_url`.
#[must_use]
pub fn static_url(update_url: &str) -> String {
    update_url.replacen("/update/", "/static/", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_to_image_name() {
        assert_eq!(
            url_to_image_name("http://172.22.50.205:8082/update/lumpy-release/R27-3837.0.0"),
            "lumpy-release/R27-3837.0.0"
        );
        assert_eq!(
            url_to_image_name("http://ds/update/trybot-link-paladin/R50-7978.0.0-b123"),
            "trybot-link-paladin/R50-7978.0.0-b123"
        );
    }

    #[test]
    fn test_release_pattern() {
        assert!(is_release_build("lumpy-release/R27-3837.0.0"));
        assert!(!is_release_build("lumpy-release/R27-3837.1.2"));
        assert!(!is_release_build("lumpy-paladin/R27-3837.0.0-rc2"));
        assert!(!is_release_build("trybot-lumpy-release/R27-3837.0.0-b42"));
    }

    #[test]
    fn test_patterns() {
        assert_eq!(
            stable_image_name("{board}-release/{version}", "link", "R50-7978.0.0"),
            "link-release/R50-7978.0.0"
        );
        assert_eq!(
            update_url("{devserver}/update/{image}", "http://ds:8082/", "link-release/R1-1.0.0"),
            "http://ds:8082/update/link-release/R1-1.0.0"
        );
        assert_eq!(
            static_url("http://ds:8082/update/link-release/R1-1.0.0"),
            "http://ds:8082/static/link-release/R1-1.0.0"
        );
        assert_eq!(image_version("link-release/R1-1.0.0"), "R1-1.0.0");
    }

    #[test]
    fn test_version_match() {
        assert!(version_match("peppy-release/R43-6908.0.0", "6908.0.0"));
        assert!(version_match("link-paladin/R50-7978.0.0-rc2", "7978.0.0"));
        assert!(!version_match("peppy-release/R43-6908.0.0", "6908.1.0"));
        assert!(!version_match("peppy-release/R43-6908.0.0", "6908.0"));
        assert!(!version_match("peppy-release/R43-6908.0.0", ""));
    }
}
