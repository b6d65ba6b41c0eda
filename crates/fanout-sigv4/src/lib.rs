// SPDX-License-Identifier: MIT OR Apache-2.0
//! AWS SigV4-family request signing.
//!
//! Produces the `Authorization` header for a canonical request, using a
//! date-scoped derived key. The derived key rolls over at UTC midnight;
//! callers are expected to re-derive one per signing day (`DerivedKey`
//! carries its own `date` so staleness is checkable, not enforced here).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fanout_config::Credentials;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Fixed signing algorithm tag.
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Minimum canonical/signed header set required by this signer.
pub const SIGNED_HEADERS: &str = "host;x-amz-date";

/// The inputs needed to build a canonical request (method, path, query,
/// the two required headers, and the raw body).
#[derive(Debug, Clone)]
pub struct CanonicalRequestInput<'a> {
    /// HTTP method, e.g. `"POST"`.
    pub method: &'a str,
    /// URI path, e.g. `"/2015-03-31/functions/echo/invocations"`.
    pub path: &'a str,
    /// Raw (unencoded) query parameters; canonicalized and sorted here.
    pub query: &'a [(&'a str, &'a str)],
    /// Request host header value.
    pub host: &'a str,
    /// `x-amz-date` header value, `YYYYMMDDThhmmssZ`.
    pub amz_date: &'a str,
    /// Raw request body.
    pub body: &'a [u8],
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Build the canonical request string (spec §4.1 step 1 input).
pub fn build_canonical_request(input: &CanonicalRequestInput<'_>) -> String {
    let canonical_query = {
        let mut pairs: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in input.query {
            pairs.insert(percent_encode(k), percent_encode(v));
        }
        pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    };

    let canonical_headers = format!("host:{}\nx-amz-date:{}\n", input.host, input.amz_date);
    let payload_hash = hex::encode(Sha256::digest(input.body));

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method, input.path, canonical_query, canonical_headers, SIGNED_HEADERS, payload_hash
    )
}

/// Build the credential scope string `<date>/<region>/<service>/aws4_request`.
pub fn build_credential_scope(date: &str, region: &str, service: &str) -> String {
    format!("{date}/{region}/{service}/aws4_request")
}

/// Build the string-to-sign from a canonical request, timestamp, and
/// credential scope.
pub fn build_string_to_sign(canonical_request: &str, amz_date: &str, credential_scope: &str) -> String {
    let hashed = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{amz_date}\n{credential_scope}\n{hashed}")
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// A date/region/service-scoped derived signing key, valid for one UTC day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    /// The `YYYYMMDD` date this key is scoped to.
    pub date: String,
    /// Region this key is scoped to.
    pub region: String,
    /// Service this key is scoped to.
    pub service: String,
    /// The access key id this key signs on behalf of.
    pub access_key_id: String,
    bytes: Vec<u8>,
}

impl DerivedKey {
    /// Derive a new key via the four-step HMAC-SHA256 chain:
    /// secret → date → region → service → `"aws4_request"`.
    pub fn derive(credentials: &Credentials, service: &str, date: &str) -> Self {
        let k_secret = format!("AWS4{}", credentials.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date);
        let k_region = hmac_sha256(&k_date, &credentials.region);
        let k_service = hmac_sha256(&k_region, service);
        let k_signing = hmac_sha256(&k_service, "aws4_request");
        Self {
            date: date.to_string(),
            region: credentials.region.clone(),
            service: service.to_string(),
            access_key_id: credentials.access_key_id.clone(),
            bytes: k_signing,
        }
    }

    /// Whether this key is still valid for the given `YYYYMMDD` date.
    pub fn is_valid_for(&self, date: &str) -> bool {
        self.date == date
    }
}

/// Sign a canonical request, returning the full `Authorization` header
/// value.
pub fn sign(key: &DerivedKey, input: &CanonicalRequestInput<'_>) -> String {
    let credential_scope = build_credential_scope(&key.date, &key.region, &key.service);
    let canonical_request = build_canonical_request(input);
    let string_to_sign = build_string_to_sign(&canonical_request, input.amz_date, &credential_scope);
    let signature = hex::encode(hmac_sha256(&key.bytes, &string_to_sign));

    format!(
        "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
        key.access_key_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials() -> Credentials {
        Credentials {
            region: "us-east-1".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
        }
    }

    #[test]
    fn derived_key_matches_known_test_vector() {
        let creds = test_credentials();
        let key = DerivedKey::derive(&creds, "iam", "20150830");
        assert_eq!(
            hex::encode(&key.bytes),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn derived_key_is_valid_only_for_its_date() {
        let key = DerivedKey::derive(&test_credentials(), "lambda", "20230101");
        assert!(key.is_valid_for("20230101"));
        assert!(!key.is_valid_for("20230102"));
    }

    #[test]
    fn canonical_request_shape() {
        let input = CanonicalRequestInput {
            method: "POST",
            path: "/2015-03-31/functions/echo/invocations",
            query: &[("Qualifier", "$LATEST")],
            host: "lambda.eu-central-1.amazonaws.com",
            amz_date: "20230101T000000Z",
            body: br#"{"test":42}"#,
        };
        let cr = build_canonical_request(&input);
        let lines: Vec<&str> = cr.split('\n').collect();
        assert_eq!(lines[0], "POST");
        assert_eq!(lines[1], "/2015-03-31/functions/echo/invocations");
        assert_eq!(lines[2], "Qualifier=%24LATEST");
        assert_eq!(lines[3], "host:lambda.eu-central-1.amazonaws.com");
        assert_eq!(lines[4], "x-amz-date:20230101T000000Z");
        assert_eq!(lines[5], "");
        assert_eq!(lines[6], SIGNED_HEADERS);
        // lines[7] is the hex SHA-256 of the body; fixed length, fixed alphabet.
        assert_eq!(lines[7].len(), 64);
        assert!(lines[7].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn credential_scope_format() {
        assert_eq!(
            build_credential_scope("20150830", "us-east-1", "iam"),
            "20150830/us-east-1/iam/aws4_request"
        );
    }

    #[test]
    fn string_to_sign_prefix() {
        let sts = build_string_to_sign("canonical", "20150830T123600Z", "20150830/us-east-1/iam/aws4_request");
        assert!(sts.starts_with("AWS4-HMAC-SHA256\n20150830T123600Z\n20150830/us-east-1/iam/aws4_request\n"));
        let hash_part = sts.rsplit('\n').next().unwrap();
        assert_eq!(hash_part.len(), 64);
    }

    #[test]
    fn authorization_header_shape() {
        let creds = test_credentials();
        let key = DerivedKey::derive(&creds, "lambda", "20230101");
        let input = CanonicalRequestInput {
            method: "POST",
            path: "/2015-03-31/functions/echo/invocations",
            query: &[("Qualifier", "$LATEST")],
            host: "lambda.us-east-1.amazonaws.com",
            amz_date: "20230101T000000Z",
            body: b"{}",
        };
        let header = sign(&key, &input);
        assert!(header.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20230101/us-east-1/lambda/aws4_request, SignedHeaders=host;x-amz-date, Signature="));
    }

    #[test]
    fn percent_encoding_is_stable_for_unreserved_chars() {
        assert_eq!(percent_encode("abcXYZ019-_.~"), "abcXYZ019-_.~");
        assert_eq!(percent_encode("$LATEST"), "%24LATEST");
        assert_eq!(percent_encode("a b"), "a%20b");
    }
}
