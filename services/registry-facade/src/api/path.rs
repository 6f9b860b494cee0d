//! Parsing of `/v2/` request paths.

const MAX_NAME_LEN: usize = 255;

/// What a `/v2/{*path}` request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target<'a> {
    Manifest { name: &'a str, reference: &'a str },
    Blob { name: &'a str, digest: &'a str },
    /// Anything else, answered like the base route.
    Other,
}

/// Splits the part after `/v2/`. Names may contain `manifests` or `blobs`
/// segments themselves, so the last occurrence is the separator.
pub fn parse(path: &str) -> Target<'_> {
    let path = path.trim_start_matches('/');
    if let Some(idx) = path.rfind("/manifests/") {
        let reference = &path[idx + "/manifests/".len()..];
        if !reference.is_empty() && !reference.contains('/') {
            return Target::Manifest {
                name: &path[..idx],
                reference,
            };
        }
    }
    if let Some(idx) = path.rfind("/blobs/") {
        let digest = &path[idx + "/blobs/".len()..];
        if !digest.is_empty() && !digest.contains('/') {
            return Target::Blob {
                name: &path[..idx],
                digest,
            };
        }
    }
    Target::Other
}

/// Checks a repository name against the distribution grammar: slash
/// separated components of lowercase alphanumerics, joined within a
/// component by `.`, `_`, `__` or any run of `-`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && name.split('/').all(is_valid_component)
}

fn is_valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    let (Some(&first), Some(&last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !alnum(first) || !alnum(last) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let sep = &component[start..i];
        let ok = matches!(sep, "." | "_" | "__") || sep.bytes().all(|b| b == b'-');
        if !ok {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            parse("remote/ws-1/manifests/latest"),
            Target::Manifest {
                name: "remote/ws-1",
                reference: "latest"
            }
        );
        assert_eq!(
            parse("fixed/blobs/ws/blobs/sha256:abc"),
            Target::Blob {
                name: "fixed/blobs/ws",
                digest: "sha256:abc"
            }
        );
        assert_eq!(parse("_catalog"), Target::Other);
        assert_eq!(parse("remote/ws-1/manifests/"), Target::Other);
        assert_eq!(parse("remote/ws-1/tags/list"), Target::Other);
    }

    #[rstest]
    #[case("remote/ws-1", true)]
    #[case("fixed/a.b_c__d---e", true)]
    #[case("library/ubuntu", true)]
    #[case("Remote/ws", false)]
    #[case("remote//ws", false)]
    #[case("remote/-ws", false)]
    #[case("remote/ws.", false)]
    #[case("remote/a..b", false)]
    #[case("remote/a___b", false)]
    #[case("remote/a.-b", false)]
    #[case("", false)]
    fn test_name_validation(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(is_valid_name(name), valid);
    }

    #[test]
    fn test_name_length_limit() {
        assert!(is_valid_name(&"a".repeat(MAX_NAME_LEN)));
        assert!(!is_valid_name(&"a".repeat(MAX_NAME_LEN + 1)));
    }
}
