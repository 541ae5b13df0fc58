//! SSO flow: root macaroon acquisition, caveat discharge and discharge
//! refresh. Only the four operations the store client needs.

use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthError;
use crate::client::JSON_CONTENT_TYPE;

#[derive(Deserialize)]
struct MacaroonResponse {
    macaroon: String,
}

#[derive(Deserialize)]
struct DischargeResponse {
    discharge_macaroon: String,
}

#[derive(Deserialize, Default)]
struct SsoError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn translate_sso_error(status: u16, err: SsoError) -> AuthError {
    match err.code.as_str() {
        "TWOFACTOR_REQUIRED" => AuthError::TwoFactorRequired,
        "TWOFACTOR_FAILURE" => AuthError::TwoFactorFailed,
        "INVALID_CREDENTIALS" | "INVALID_DATA" | "ACCOUNT_SUSPENDED" | "ACCOUNT_DEACTIVATED" => {
            AuthError::InvalidAuthData(err.message)
        }
        _ => AuthError::InvalidAuthData(format!(
            "server returned status {status}: {}",
            err.message
        )),
    }
}

async fn sso_error_from(resp: reqwest::Response) -> AuthError {
    let status = resp.status().as_u16();
    let err = resp.json::<SsoError>().await.unwrap_or_default();
    translate_sso_error(status, err)
}

/// Request a root store macaroon from the developer dashboard.
pub(crate) async fn request_store_macaroon(
    client: &reqwest::Client,
    dashboard_url: &str,
) -> Result<String, AuthError> {
    let url = format!("{}dev/api/acl/", dashboard_url);
    let body = json!({
        "permissions": ["package_access", "package_manage", "package_purchase"],
    });
    let resp = client
        .post(&url)
        .header("User-Agent", crate::USER_AGENT)
        .header("Accept", JSON_CONTENT_TYPE)
        .json(&body)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(sso_error_from(resp).await);
    }
    let mac: MacaroonResponse = resp.json().await?;
    Ok(mac.macaroon)
}

/// Ask the SSO service to discharge the login caveat with the user's
/// credentials.
pub(crate) async fn discharge_auth_caveat(
    client: &reqwest::Client,
    sso_base_url: &str,
    caveat_id: &str,
    username: &str,
    password: &str,
    otp: &str,
) -> Result<String, AuthError> {
    let mut body = json!({
        "email": username,
        "password": password,
        "caveat_id": caveat_id,
    });
    if !otp.is_empty() {
        body["otp"] = json!(otp);
    }
    request_discharge(client, &format!("{sso_base_url}/tokens/discharge"), body).await
}

/// Ask the SSO service for a refreshed copy of an expired discharge.
pub(crate) async fn refresh_discharge_macaroon(
    client: &reqwest::Client,
    sso_base_url: &str,
    discharge: &str,
) -> Result<String, AuthError> {
    let body = json!({ "discharge_macaroon": discharge });
    request_discharge(client, &format!("{sso_base_url}/tokens/refresh"), body).await
}

async fn request_discharge(
    client: &reqwest::Client,
    url: &str,
    body: serde_json::Value,
) -> Result<String, AuthError> {
    let resp = client
        .post(url)
        .header("User-Agent", crate::USER_AGENT)
        .header("Accept", JSON_CONTENT_TYPE)
        .json(&body)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(sso_error_from(resp).await);
    }
    let discharge: DischargeResponse = resp.json().await?;
    Ok(discharge.discharge_macaroon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_known_codes() {
        let err = translate_sso_error(
            401,
            SsoError {
                code: "TWOFACTOR_REQUIRED".into(),
                message: String::new(),
            },
        );
        assert!(matches!(err, AuthError::TwoFactorRequired));

        let err = translate_sso_error(
            403,
            SsoError {
                code: "TWOFACTOR_FAILURE".into(),
                message: String::new(),
            },
        );
        assert!(matches!(err, AuthError::TwoFactorFailed));

        let err = translate_sso_error(
            401,
            SsoError {
                code: "INVALID_CREDENTIALS".into(),
                message: "wrong password".into(),
            },
        );
        assert!(matches!(err, AuthError::InvalidAuthData(m) if m == "wrong password"));
    }

    #[test]
    fn translate_unknown_code_keeps_status() {
        let err = translate_sso_error(500, SsoError::default());
        assert!(matches!(err, AuthError::InvalidAuthData(m) if m.contains("500")));
    }
}
