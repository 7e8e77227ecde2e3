//! Session establishment against the iCloud web endpoints.
//!
//! Everything here stays out of the sync core: cookies persist under the
//! configured cookie directory, two-factor prompts happen on the terminal,
//! and the result is an [`HttpDriveClient`] bound to the account's drivews
//! and docws service roots.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{DriveError, HttpDriveClient};

const SETUP_URL: &str = "https://setup.icloud.com/setup/ws/1";
const AUTH_URL: &str = "https://idmsa.apple.com/appleauth/auth";
const AUTH_MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const KEYRING_SERVICE: &str = "icloudds";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: Option<String>,
    pub cookie_directory: PathBuf,
}

/// Resolve the account password: explicit flag, then the system keyring,
/// then an interactive prompt.
pub fn resolve_password(username: &str, explicit: Option<&str>) -> Result<String, DriveError> {
    if let Some(password) = explicit {
        return Ok(password.to_string());
    }
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, username) {
        if let Ok(password) = entry.get_password() {
            debug!(username, "using password from keyring");
            return Ok(password);
        }
    }
    prompt("iCloud password: ")
}

pub async fn authenticate(config: &AuthConfig) -> Result<HttpDriveClient, DriveError> {
    let http = Client::builder()
        .cookie_store(true)
        .timeout(REQUEST_TIMEOUT)
        .build()?;

    let mut failure_count = 0u32;
    loop {
        match try_session(&http, config).await {
            Ok(client) => {
                info!(username = %config.username, "authenticated");
                return Ok(client);
            }
            Err(DriveError::Auth(reason)) => {
                failure_count += 1;
                warn!(
                    username = %config.username,
                    failure_count,
                    %reason,
                    "login attempt failed"
                );
                if failure_count >= AUTH_MAX_RETRIES {
                    return Err(DriveError::Auth(reason));
                }
            }
            Err(err) => return Err(err),
        }
    }
}

async fn try_session(http: &Client, config: &AuthConfig) -> Result<HttpDriveClient, DriveError> {
    // A previously trusted session can skip the idmsa round trip entirely.
    let stored = SessionState::load(&config.cookie_directory, &config.username);
    if let Some(state) = &stored {
        if let Ok(client) = account_login(http, &state.session_token).await {
            return Ok(client);
        }
        debug!("stored session token rejected, signing in again");
    }

    let password = resolve_password(&config.username, config.password.as_deref())?;
    let signin = http
        .post(format!("{AUTH_URL}/signin"))
        .json(&serde_json::json!({
            "accountName": config.username,
            "password": password,
            "rememberMe": true,
            "trustTokens": stored.map(|s| s.trust_token).into_iter().collect::<Vec<_>>(),
        }))
        .send()
        .await?;

    let status = signin.status();
    let session_token = header_value(&signin, "X-Apple-Session-Token");
    if status == StatusCode::CONFLICT {
        // 409 means the credentials were accepted but 2FA is outstanding.
        verify_second_factor(http, &signin).await?;
    } else if !status.is_success() {
        let body = signin.text().await.unwrap_or_default();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(DriveError::Auth(format!("invalid credentials: {body}")));
        }
        return Err(DriveError::Api { status, body });
    }

    let trust = trust_session(http).await?;
    let session_token = trust
        .session_token
        .or(session_token)
        .ok_or_else(|| DriveError::Auth("no session token issued".into()))?;
    let state = SessionState {
        session_token,
        trust_token: trust.trust_token.unwrap_or_default(),
    };
    state.store(&config.cookie_directory, &config.username)?;
    account_login(http, &state.session_token).await
}

async fn verify_second_factor(http: &Client, signin: &reqwest::Response) -> Result<(), DriveError> {
    let scnt = header_value(signin, "scnt").unwrap_or_default();
    let session_id = header_value(signin, "X-Apple-ID-Session-Id").unwrap_or_default();
    eprintln!("Two-factor (2FA) authentication required.");
    let code = prompt("Please enter verification code: ")?;
    let response = http
        .post(format!("{AUTH_URL}/verify/trusteddevice/securitycode"))
        .header("scnt", &scnt)
        .header("X-Apple-ID-Session-Id", &session_id)
        .json(&serde_json::json!({ "securityCode": { "code": code.trim() } }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(DriveError::Auth("2FA verification code rejected".into()));
    }
    Ok(())
}

async fn trust_session(http: &Client) -> Result<TrustTokens, DriveError> {
    let response = http.get(format!("{AUTH_URL}/2sv/trust")).send().await?;
    Ok(TrustTokens {
        session_token: header_value(&response, "X-Apple-Session-Token"),
        trust_token: header_value(&response, "X-Apple-TwoSV-Trust-Token"),
    })
}

/// Exchange the session token for the per-account web service roots.
async fn account_login(http: &Client, session_token: &str) -> Result<HttpDriveClient, DriveError> {
    let response = http
        .post(format!("{SETUP_URL}/accountLogin"))
        .json(&serde_json::json!({
            "dsWebAuthToken": session_token,
            "extended_login": true,
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(DriveError::Auth(format!("session rejected: {body}")));
        }
        return Err(DriveError::Api { status, body });
    }
    let login: AccountLogin = response.json().await?;
    let drivews = login
        .webservices
        .drivews
        .ok_or(DriveError::MissingField("drivews service root"))?;
    let docws = login
        .webservices
        .docws
        .ok_or(DriveError::MissingField("docws service root"))?;
    HttpDriveClient::new(
        http.clone(),
        &drivews.url,
        &docws.url,
        login.ds_info.dsid,
    )
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn prompt(message: &str) -> Result<String, DriveError> {
    eprint!("{message}");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

struct TrustTokens {
    session_token: Option<String>,
    trust_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionState {
    session_token: String,
    trust_token: String,
}

impl SessionState {
    fn path(cookie_directory: &Path, username: &str) -> PathBuf {
        let sanitized: String = username
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        cookie_directory.join(format!("{sanitized}.session"))
    }

    fn load(cookie_directory: &Path, username: &str) -> Option<Self> {
        let raw = std::fs::read_to_string(Self::path(cookie_directory, username)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn store(&self, cookie_directory: &Path, username: &str) -> Result<(), DriveError> {
        std::fs::create_dir_all(cookie_directory)?;
        let raw = serde_json::to_string_pretty(self).expect("session state serializes");
        std::fs::write(Self::path(cookie_directory, username), raw)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AccountLogin {
    webservices: WebServices,
    #[serde(rename = "dsInfo")]
    ds_info: DsInfo,
}

#[derive(Debug, Deserialize)]
struct WebServices {
    #[serde(default)]
    drivews: Option<ServiceRoot>,
    #[serde(default)]
    docws: Option<ServiceRoot>,
}

#[derive(Debug, Deserialize)]
struct ServiceRoot {
    url: String,
}

#[derive(Debug, Deserialize)]
struct DsInfo {
    dsid: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn session_state_round_trips_through_cookie_directory() {
        let dir = tempdir().unwrap();
        let state = SessionState {
            session_token: "tok".into(),
            trust_token: "trust".into(),
        };
        state.store(dir.path(), "user@example.com").unwrap();
        let loaded = SessionState::load(dir.path(), "user@example.com").unwrap();
        assert_eq!(loaded.session_token, "tok");
        assert_eq!(loaded.trust_token, "trust");
    }

    #[test]
    fn session_path_sanitizes_username() {
        let path = SessionState::path(Path::new("/tmp/cookies"), "a.b@example.com");
        assert_eq!(
            path,
            PathBuf::from("/tmp/cookies/a_b_example_com.session")
        );
    }

    #[test]
    fn explicit_password_wins_over_keyring() {
        let password = resolve_password("nobody@example.com", Some("secret")).unwrap();
        assert_eq!(password, "secret");
    }
}
