pub mod cors {
    use tower_http::cors::{AllowOrigin, Any, CorsLayer};
    use wildmatch::WildMatch;

    /// Origin allow-list compiled once from config patterns. `*` wildcards
    /// are honored, so `https://*.example.com` admits every subdomain.
    #[derive(Clone)]
    pub struct OriginPatterns {
        patterns: Vec<WildMatch>,
    }

    impl OriginPatterns {
        /// `None` when no origins are configured; callers then skip the CORS
        /// layer entirely.
        pub fn compile(patterns: &[String]) -> Option<Self> {
            if patterns.is_empty() {
                return None;
            }
            Some(Self {
                patterns: patterns.iter().map(|p| WildMatch::new(p)).collect(),
            })
        }

        pub fn matches(&self, origin: &str) -> bool {
            self.patterns.iter().any(|pattern| pattern.matches(origin))
        }

        pub fn into_layer(self) -> CorsLayer {
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _parts| {
                    origin
                        .to_str()
                        .map(|origin| self.matches(origin))
                        .unwrap_or(false)
                }))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::OriginPatterns;

        #[test]
        fn empty_config_means_no_layer() {
            assert!(OriginPatterns::compile(&[]).is_none());
        }

        #[test]
        fn wildcards_admit_subdomains_only() {
            let patterns = OriginPatterns::compile(&[
                "https://*.example.com".to_string(),
                "http://localhost:3000".to_string(),
            ])
            .unwrap();

            assert!(patterns.matches("https://app.example.com"));
            assert!(patterns.matches("http://localhost:3000"));
            assert!(!patterns.matches("https://example.org"));
            assert!(!patterns.matches("http://localhost:4000"));
        }
    }
}

pub mod auth {
    use axum::{
        body::Body,
        extract::{Request, State},
        http::{header, Response, StatusCode},
        middleware::Next,
        response::IntoResponse,
    };

    // Shared bearer token middleware with realm support
    // State is a tuple: (token, realm)
    pub async fn verify_bearer_with_realm(
        State((token, realm)): State<(String, String)>,
        req: Request,
        next: Next,
    ) -> impl IntoResponse {
        let unauthorized = || {
            Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(
                    header::WWW_AUTHENTICATE,
                    format!("Bearer realm=\"{}\"", realm),
                )
                .body(Body::from("Unauthorized"))
                .unwrap()
        };

        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_bearer);

        match presented {
            Some(presented) if presented == token => next.run(req).await,
            _ => unauthorized().into_response(),
        }
    }

    /// The scheme name is case-insensitive; the token is not.
    fn extract_bearer(header_value: &str) -> Option<&str> {
        let (scheme, token) = header_value.trim().split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") {
            Some(token.trim())
        } else {
            None
        }
    }

    #[cfg(test)]
    mod tests {
        use super::extract_bearer;

        #[test]
        fn bearer_scheme_is_case_insensitive() {
            assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
            assert_eq!(extract_bearer("bearer abc"), Some("abc"));
            assert_eq!(extract_bearer("BEARER abc"), Some("abc"));
            assert_eq!(extract_bearer("Basic abc"), None);
            assert_eq!(extract_bearer("Bearer"), None);
        }
    }
}
