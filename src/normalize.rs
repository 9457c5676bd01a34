use url::{form_urlencoded, Url};

/// Hosts whose query string never identifies the asset.
const QUERYLESS_HOSTS: &[&str] = &[
    "i.redd.it",
    "preview.redd.it",
    "external-preview.redd.it",
    "redgifs.com",
];

/// Signature and expiry parameters that rotate between requests for the
/// same asset.
const EPHEMERAL_PARAMS: &[&str] = &[
    "s",
    "sig",
    "signature",
    "token",
    "expires",
    "ttl",
    "key",
    "st",
    "se",
];

/// Click-id parameters appended by share links.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "gclsrc", "dclid", "igshid", "ref_src"];

/// Canonicalise a media URL into a stable dedup key.
///
/// Invalid and non-HTTP URLs are returned unchanged (after `&amp;`
/// unescaping) so the function stays total.
#[must_use]
pub fn normalize_media_url(url: &str) -> String {
    // Listing JSON carries HTML-escaped ampersands.
    let unescaped = url.trim().replace("&amp;", "&");

    let Ok(mut normalized) = Url::parse(&unescaped) else {
        return unescaped;
    };

    if normalized.scheme() != "http" && normalized.scheme() != "https" {
        return unescaped;
    }

    if normalized.scheme() == "http" {
        let _ = normalized.set_scheme("https");
    }

    if let Some(host) = normalized.host_str() {
        let lower_host = host.to_lowercase();
        if host != lower_host {
            let _ = normalized.set_host(Some(&lower_host));
        }
    }

    if normalized.port() == Some(443) || normalized.port() == Some(80) {
        let _ = normalized.set_port(None);
    }

    normalized.set_fragment(None);

    let host = normalized.host_str().unwrap_or_default().to_string();
    if is_queryless_host(&host) {
        normalized.set_query(None);
        return normalized.to_string();
    }

    let kept: Vec<(String, String)> = normalized
        .query_pairs()
        .filter(|(key, _)| !is_volatile_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        normalized.set_query(None);
    } else {
        // `query_pairs` decodes, so the survivors must be encoded again.
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &kept {
            if v.is_empty() {
                query.append_key_only(k);
            } else {
                query.append_pair(k, v);
            }
        }
        normalized.set_query(Some(&query.finish()));
    }

    normalized.to_string()
}

fn is_queryless_host(host: &str) -> bool {
    QUERYLESS_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{h}")))
}

fn is_volatile_param(key: &str) -> bool {
    let lower = key.to_lowercase();
    lower.starts_with("utm_")
        || EPHEMERAL_PARAMS.contains(&lower.as_str())
        || TRACKING_PARAMS.contains(&lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reddit_image_drops_query() {
        assert_eq!(
            normalize_media_url("https://i.redd.it/abc123.jpg?width=640&s=deadbeef"),
            "https://i.redd.it/abc123.jpg"
        );
    }

    #[test]
    fn test_preview_drops_signature() {
        assert_eq!(
            normalize_media_url("https://preview.redd.it/abc.png?width=960&amp;format=png&amp;s=1f2e"),
            "https://preview.redd.it/abc.png"
        );
    }

    #[test]
    fn test_redgifs_subdomain_drops_query() {
        assert_eq!(
            normalize_media_url("https://media.redgifs.com/Clip.mp4?expires=1"),
            "https://media.redgifs.com/Clip.mp4"
        );
    }

    #[test]
    fn test_generic_host_strips_ephemeral_params() {
        assert_eq!(
            normalize_media_url("https://cdn.example.com/v.mp4?id=7&token=x&utm_source=y&se=2"),
            "https://cdn.example.com/v.mp4?id=7"
        );
    }

    #[test]
    fn test_force_https_and_lowercase_host() {
        assert_eq!(
            normalize_media_url("http://I.IMGUR.COM:80/a.gif#frag"),
            "https://i.imgur.com/a.gif"
        );
    }

    #[test]
    fn test_stable_under_repeat() {
        let once = normalize_media_url("https://cdn.example.com/v.mp4?b=2&a=1&sig=z");
        assert_eq!(normalize_media_url(&once), once);
    }

    #[test]
    fn test_encoded_values_survive() {
        assert_eq!(
            normalize_media_url("https://cdn.example.com/search?q=a%26b&utm_source=x&flag"),
            "https://cdn.example.com/search?q=a%26b&flag"
        );
        let once = normalize_media_url("https://cdn.example.com/v.mp4?name=x%3Dy");
        assert_eq!(once, "https://cdn.example.com/v.mp4?name=x%3Dy");
        assert_eq!(normalize_media_url(&once), once);
    }

    #[test]
    fn test_invalid_url_passthrough() {
        assert_eq!(normalize_media_url("not a url"), "not a url");
    }
}
