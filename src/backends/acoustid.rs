//! AcoustID fingerprint lookup backed by `fpcalc` and `ureq`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use super::{classify_ureq_error, FingerprintBackend, FingerprintMatch};
use crate::error::ResolveError;

const ACOUSTID_LOOKUP_URL: &str = "https://api.acoustid.org/v2/lookup";
const SERVICE_NAME: &str = "AcoustID";

/// Output of `fpcalc -json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ComputedFingerprint {
    duration: f64,
    fingerprint: String,
}

/// Fingerprint backend that shells out to `fpcalc` and queries AcoustID.
pub struct AcoustIdClient {
    http_client: ureq::Agent,
    fpcalc_path: PathBuf,
    lookup_url: String,
}

impl AcoustIdClient {
    pub fn new(fpcalc_path: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(request_timeout)
            .timeout_write(request_timeout)
            .build();
        Self {
            http_client,
            fpcalc_path: fpcalc_path.into(),
            lookup_url: ACOUSTID_LOOKUP_URL.to_string(),
        }
    }

    fn compute_fingerprint(&self, path: &Path) -> Result<ComputedFingerprint, ResolveError> {
        let output = Command::new(&self.fpcalc_path)
            .arg("-json")
            .arg(path)
            .output()
            .map_err(|error| {
                ResolveError::local_io(
                    &format!("cannot run {}", self.fpcalc_path.display()),
                    &error,
                )
            })?;
        if !output.status.success() {
            return Err(ResolveError::LocalIo(format!(
                "fingerprint generation failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        serde_json::from_slice(&output.stdout).map_err(|error| {
            ResolveError::LocalIo(format!(
                "unreadable fpcalc output for {}: {error}",
                path.display()
            ))
        })
    }
}

impl FingerprintBackend for AcoustIdClient {
    fn lookup(&self, api_key: &str, path: &Path) -> Result<Vec<FingerprintMatch>, ResolveError> {
        let computed = self.compute_fingerprint(path)?;
        let duration = (computed.duration.round() as i64).to_string();
        debug!(
            "AcoustID lookup for {} (duration {}s)",
            path.display(),
            duration
        );

        let response = self
            .http_client
            .post(&self.lookup_url)
            .set("Accept", "application/json")
            .send_form(&[
                ("client", api_key),
                ("duration", duration.as_str()),
                ("fingerprint", computed.fingerprint.as_str()),
                ("meta", "recordings"),
                ("format", "json"),
            ])
            .map_err(|error| classify_ureq_error(SERVICE_NAME, error))?;
        let body: Value = response.into_json().map_err(|error| {
            if error.kind() == std::io::ErrorKind::InvalidData {
                ResolveError::NonTransient(format!("{SERVICE_NAME} returned invalid JSON: {error}"))
            } else {
                ResolveError::Transient(format!("{SERVICE_NAME} response read failed: {error}"))
            }
        })?;
        parse_lookup_response(body)
    }
}

/// Validates a lookup response and extracts its ordered results.
pub fn parse_lookup_response(body: Value) -> Result<Vec<FingerprintMatch>, ResolveError> {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if status != "ok" {
        let message = body
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("no error message");
        return Err(ResolveError::NonTransient(format!(
            "{SERVICE_NAME} status: {status} ({message})"
        )));
    }
    let Some(results) = body.get("results") else {
        return Err(ResolveError::NonTransient(format!(
            "{SERVICE_NAME} results not included"
        )));
    };
    Vec::<FingerprintMatch>::deserialize(results).map_err(|error| {
        ResolveError::NonTransient(format!("{SERVICE_NAME} results malformed: {error}"))
    })
}
