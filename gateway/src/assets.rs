//! Static Asset Server (spec §4.9): picks a pre-compressed variant of a static file by
//! parsing `Accept-Encoding` tokens with `q` weights, preferring brotli over gzip over
//! identity.

use std::path::{Path, PathBuf};

/// The encoding chosen for a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChosenEncoding {
    Brotli,
    Gzip,
    Identity,
}

impl ChosenEncoding {
    pub fn content_encoding_header(self) -> Option<&'static str> {
        match self {
            ChosenEncoding::Brotli => Some("br"),
            ChosenEncoding::Gzip => Some("gzip"),
            ChosenEncoding::Identity => None,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ChosenEncoding::Brotli => ".br",
            ChosenEncoding::Gzip => ".gz",
            ChosenEncoding::Identity => "",
        }
    }
}

/// One parsed `Accept-Encoding` token and its `q` weight (default 1.0).
struct AcceptedEncoding {
    name: String,
    q: f32,
}

fn parse_accept_encoding(header: &str) -> Vec<AcceptedEncoding> {
    header
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let mut segments = part.split(';');
            let name = segments.next()?.trim().to_lowercase();
            let q = segments
                .find_map(|seg| seg.trim().strip_prefix("q="))
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(1.0);
            Some(AcceptedEncoding { name, q })
        })
        .collect()
}

fn q_for(accepted: &[AcceptedEncoding], name: &str) -> f32 {
    accepted
        .iter()
        .find(|a| a.name == name || a.name == "*")
        .map(|a| a.q)
        .unwrap_or(0.0)
}

/// Chooses brotli when listed with `q > 0`, else gzip, else identity (spec §4.9).
pub fn choose_encoding(accept_encoding: Option<&str>) -> ChosenEncoding {
    let Some(header) = accept_encoding else { return ChosenEncoding::Identity };
    let accepted = parse_accept_encoding(header);

    if q_for(&accepted, "br") > 0.0 {
        return ChosenEncoding::Brotli;
    }
    if q_for(&accepted, "gzip") > 0.0 {
        return ChosenEncoding::Gzip;
    }
    ChosenEncoding::Identity
}

/// Resolves the on-disk path to serve for `requested`, preferring the chosen encoding's
/// pre-compressed sibling when present, falling back to the identity file.
pub fn resolve_variant(root: &Path, requested: &str, accept_encoding: Option<&str>) -> Option<(PathBuf, ChosenEncoding)> {
    let base = root.join(requested.trim_start_matches('/'));
    let chosen = choose_encoding(accept_encoding);

    for candidate in [chosen, ChosenEncoding::Identity] {
        let path = PathBuf::from(format!("{}{}", base.display(), candidate.suffix()));
        if path.is_file() {
            return Some((path, candidate));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn choose_encoding_prefers_brotli_over_gzip() {
        assert_eq!(choose_encoding(Some("gzip, br;q=0.8")), ChosenEncoding::Brotli);
    }

    #[test]
    fn choose_encoding_falls_back_to_gzip_when_brotli_absent() {
        assert_eq!(choose_encoding(Some("deflate, gzip;q=0.5")), ChosenEncoding::Gzip);
    }

    #[test]
    fn choose_encoding_ignores_zero_weight_brotli() {
        assert_eq!(choose_encoding(Some("br;q=0, gzip")), ChosenEncoding::Gzip);
    }

    #[test]
    fn choose_encoding_identity_when_header_absent() {
        assert_eq!(choose_encoding(None), ChosenEncoding::Identity);
    }

    #[test]
    fn resolve_variant_prefers_precompressed_file_when_present() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), b"plain").unwrap();
        fs::write(dir.path().join("app.js.br"), b"brotli").unwrap();

        let (path, encoding) = resolve_variant(dir.path(), "app.js", Some("br;q=1.0")).unwrap();
        assert_eq!(encoding, ChosenEncoding::Brotli);
        assert!(path.ends_with("app.js.br"));
    }

    #[test]
    fn resolve_variant_falls_back_to_identity_when_no_precompressed_sibling() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<html/>").unwrap();

        let (path, encoding) = resolve_variant(dir.path(), "index.html", Some("br, gzip")).unwrap();
        assert_eq!(encoding, ChosenEncoding::Identity);
        assert!(path.ends_with("index.html"));
    }

    #[test]
    fn resolve_variant_none_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_variant(dir.path(), "missing.js", None).is_none());
    }
}
