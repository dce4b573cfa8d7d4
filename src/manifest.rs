//! Manifest inspection seam used while reassembling bundles.
//!
//! Manifest parsing belongs to the daemon, not to the transport; the engine
//! only needs one thing from a manifest it is still receiving: the payload
//! length, so that a body can be finalised without waiting for an
//! end-of-item piece.

/// Inspects (possibly partial) manifest bytes on behalf of the reassembler.
pub trait ManifestInspector {

    /// Try to learn the payload length from the given manifest bytes,
    /// which are the contiguous prefix received so far. Return `None`
    /// until the relevant field is present.
    fn body_length(&self, manifest: &[u8]) -> Option<u64>;

}


/// Inspector for the daemon's text manifest section: `key=value` lines
/// terminated by a NUL byte before the binary signature block. The payload
/// length lives in the `filesize` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextManifestInspector;

impl ManifestInspector for TextManifestInspector {

    fn body_length(&self, manifest: &[u8]) -> Option<u64> {

        let text = match manifest.iter().position(|&b| b == 0) {
            Some(end) => &manifest[..end],
            None => manifest,
        };

        for line in text.split(|&b| b == b'\n') {
            if let Some(value) = line.strip_prefix(b"filesize=") {
                let value = std::str::from_utf8(value).ok()?;
                return value.trim().parse().ok();
            }
        }

        None

    }

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn parses_filesize_field() {
        let inspector = TextManifestInspector;
        let manifest = b"service=file\nversion=1423751\nfilesize=86401\nname=map.tile\n\0sigsigsig";
        assert_eq!(inspector.body_length(manifest), Some(86401));
    }

    #[test]
    fn partial_manifest_without_field() {
        let inspector = TextManifestInspector;
        assert_eq!(inspector.body_length(b"service=file\nversi"), None);
        assert_eq!(inspector.body_length(b""), None);
    }

    #[test]
    fn malformed_value() {
        let inspector = TextManifestInspector;
        assert_eq!(inspector.body_length(b"filesize=abc\n"), None);
        // Fields inside the binary section are not text.
        assert_eq!(inspector.body_length(b"service=file\n\0filesize=5\n"), None);
    }

}
