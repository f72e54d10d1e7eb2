//! Computes the outbound request path for a selected upstream node.

/// Compute the effective outbound path given a node's configured
/// `target_path` and the inbound `request_path`.
///
/// Rules, evaluated in order:
/// 1. empty or `/` target -> request path unchanged.
/// 2. byte-exact match -> target path.
/// 3. request path == target path + trailing slash -> request path.
/// 4. request path is a boundary-safe prefix of target path + "/" -> request path.
/// 5. otherwise -> target path (explicit override, no concatenation).
pub fn rewrite_path(target_path: &str, request_path: &str) -> String {
    if target_path.is_empty() || target_path == "/" {
        return request_path.to_string();
    }

    if target_path == request_path {
        return target_path.to_string();
    }

    let with_trailing_slash = format!("{}/", target_path);
    if request_path == with_trailing_slash {
        return request_path.to_string();
    }

    if let Some(rest) = request_path.strip_prefix(target_path) {
        if rest.starts_with('/') {
            return request_path.to_string();
        }
    }

    target_path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_table() {
        let cases: &[(&str, &str, &str)] = &[
            ("", "/users/123", "/users/123"),
            ("/", "/users/123", "/users/123"),
            ("/api/v1/", "/api/v1/users/123", "/api/v1/users/123"),
            ("/api", "/users/123", "/api"),
            ("/ap", "/api/v1/users", "/ap"),
            ("/api/v1", "/api/v1/users/123", "/api/v1/users/123"),
            ("/backend/", "/users/123", "/backend/"),
        ];

        for (target, request, expected) in cases {
            assert_eq!(
                rewrite_path(target, request),
                *expected,
                "target={target}, request={request}"
            );
        }
    }

    #[test]
    fn boundary_not_crossed() {
        assert_eq!(rewrite_path("/ap", "/api/v1/users"), "/ap");
    }

    #[test]
    fn idempotent() {
        let target = "/api/v1";
        let request = "/api/v1/users/123";
        let once = rewrite_path(target, request);
        let twice = rewrite_path(&once, &once);
        assert_eq!(once, twice);
    }
}
