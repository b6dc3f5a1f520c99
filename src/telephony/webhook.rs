//! HMAC-SHA1 webhook signature verification, proxy-aware.

use crate::errors::WebhookVerifyError;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::BTreeMap;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
pub struct VerifyContext {
    pub headers: BTreeMap<String, String>,
    pub request_path_and_query: String,
    pub form_body: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub reason: Option<WebhookVerifyError>,
    pub reconstructed_url: String,
    pub ngrok_free_tier: bool,
}

fn header_ci<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Reconstruct the public URL the carrier would have used to sign the
/// request, honoring reverse-proxy forwarding headers.
fn reconstruct_url(ctx: &VerifyContext, override_public_url: Option<&str>) -> String {
    if let Some(base) = override_public_url {
        let origin = strip_path(base);
        return format!("{origin}{}", ctx.request_path_and_query);
    }

    let proto = header_ci(&ctx.headers, "X-Forwarded-Proto").unwrap_or("https");
    let host = header_ci(&ctx.headers, "X-Forwarded-Host")
        .or_else(|| header_ci(&ctx.headers, "X-Original-Host"))
        .or_else(|| header_ci(&ctx.headers, "Ngrok-Forwarded-Host"))
        .or_else(|| header_ci(&ctx.headers, "Host"))
        .unwrap_or("");
    let host = strip_port(host);
    format!("{proto}://{host}{}", ctx.request_path_and_query)
}

fn strip_path(url: &str) -> String {
    if let Some(idx) = url.find("://") {
        let rest = &url[idx + 3..];
        let end = rest.find('/').map(|i| idx + 3 + i).unwrap_or(url.len());
        url[..end].to_string()
    } else {
        url.to_string()
    }
}

fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
        _ => host,
    }
}

fn is_ngrok_free_tier(url: &str) -> bool {
    let host = strip_path(url);
    let host = host.rsplit("://").next().unwrap_or(&host);
    host.ends_with(".ngrok-free.app") || host.ends_with(".ngrok.io")
}

fn signing_string(url: &str, form_body: &BTreeMap<String, String>) -> String {
    let mut s = url.to_string();
    // BTreeMap already iterates in alphabetic key order.
    for (key, value) in form_body {
        s.push_str(key);
        s.push_str(value);
    }
    s
}

/// Verify a carrier webhook signature.
///
/// `signature_header` is the raw header value (e.g. `X-Twilio-Signature`).
pub fn verify(
    ctx: &VerifyContext,
    signature_header: Option<&str>,
    auth_token: &str,
    override_public_url: Option<&str>,
) -> VerifyOutcome {
    let url = reconstruct_url(ctx, override_public_url);

    let signature = match signature_header {
        Some(s) => s,
        None => {
            return VerifyOutcome {
                ok: false,
                reason: Some(WebhookVerifyError::MissingSignature),
                ngrok_free_tier: is_ngrok_free_tier(&url),
                reconstructed_url: url,
            };
        }
    };

    let provided = match base64::engine::general_purpose::STANDARD.decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => {
            return VerifyOutcome {
                ok: false,
                reason: Some(WebhookVerifyError::BadEncoding),
                ngrok_free_tier: is_ngrok_free_tier(&url),
                reconstructed_url: url,
            };
        }
    };

    let to_sign = signing_string(&url, &ctx.form_body);
    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(to_sign.as_bytes());

    let ok = mac.verify_slice(&provided).is_ok();
    VerifyOutcome {
        ok,
        reason: if ok {
            None
        } else {
            Some(WebhookVerifyError::SignatureMismatch)
        },
        ngrok_free_tier: if ok { false } else { is_ngrok_free_tier(&url) },
        reconstructed_url: url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(url: &str, body: &BTreeMap<String, String>, token: &str) -> String {
        let to_sign = signing_string(url, body);
        let mut mac = HmacSha1::new_from_slice(token.as_bytes()).unwrap();
        mac.update(to_sign.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn ctx_with_headers(headers: &[(&str, &str)], path: &str, body: &[(&str, &str)]) -> VerifyContext {
        VerifyContext {
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            request_path_and_query: path.to_string(),
            form_body: body.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn accepts_valid_signature() {
        let body = [("CallSid", "CA123"), ("CallStatus", "ringing")];
        let ctx = ctx_with_headers(&[("Host", "example.com")], "/voice/webhook", &body);
        let url = reconstruct_url(&ctx, None);
        let map: BTreeMap<String, String> =
            body.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let sig = sign(&url, &map, "secret");

        let outcome = verify(&ctx, Some(&sig), "secret", None);
        assert!(outcome.ok);
        assert!(outcome.reason.is_none());
    }

    #[test]
    fn signature_is_independent_of_body_param_order() {
        let body_a = [("b", "2"), ("a", "1")];
        let body_b = [("a", "1"), ("b", "2")];
        let ctx_a = ctx_with_headers(&[("Host", "example.com")], "/voice/webhook", &body_a);
        let ctx_b = ctx_with_headers(&[("Host", "example.com")], "/voice/webhook", &body_b);

        let url = reconstruct_url(&ctx_a, None);
        let sig_a = sign(&url, &ctx_a.form_body, "secret");
        let sig_b = sign(&url, &ctx_b.form_body, "secret");
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn rejects_bad_signature() {
        let ctx = ctx_with_headers(&[("Host", "example.com")], "/voice/webhook", &[]);
        let outcome = verify(&ctx, Some("bm90LXRoZS1yaWdodC1zaWc="), "secret", None);
        assert!(!outcome.ok);
    }

    #[test]
    fn flags_ngrok_free_tier_on_mismatch() {
        let ctx = ctx_with_headers(
            &[("X-Forwarded-Host", "abc123.ngrok-free.app"), ("X-Forwarded-Proto", "https")],
            "/voice/webhook",
            &[],
        );
        let outcome = verify(&ctx, Some("deadbeef"), "secret", None);
        assert!(!outcome.ok);
        assert!(outcome.ngrok_free_tier);
    }

    #[test]
    fn override_public_url_takes_priority() {
        let ctx = ctx_with_headers(&[("Host", "internal-proxy:8080")], "/voice/webhook?callId=1", &[]);
        let url = reconstruct_url(&ctx, Some("https://public.example.com"));
        assert_eq!(url, "https://public.example.com/voice/webhook?callId=1");
    }

    #[test]
    fn strips_port_from_forwarded_host() {
        let ctx = ctx_with_headers(
            &[("X-Forwarded-Host", "example.com:8443"), ("X-Forwarded-Proto", "https")],
            "/voice/webhook",
            &[],
        );
        let url = reconstruct_url(&ctx, None);
        assert_eq!(url, "https://example.com/voice/webhook");
    }
}
