//! The macaroon seam.
//!
//! Macaroon cryptography lives outside this crate; the client only needs to
//! move opaque serialized credentials around and bind discharges to their
//! root before sending them. Both operations go through a pluggable codec so
//! tests can substitute a fake.

use std::sync::Arc;

use tracing::debug;

use crate::auth::{AuthError, UserCredentials};

/// An opaque deserialized macaroon.
pub trait Macaroon: Send + Sync {
    /// The location of the service this macaroon (or discharge) addresses.
    fn location(&self) -> String;

    /// The macaroon's current signature.
    fn signature(&self) -> Vec<u8>;

    /// The id of the third-party caveat addressed to `location`, if any.
    fn third_party_caveat_id(&self, location: &str) -> Option<String>;

    /// A copy of this macaroon bound to the given root signature, ready to
    /// be sent as a discharge.
    fn bind(&self, root_signature: &[u8]) -> Box<dyn Macaroon>;
}

/// Serialization boundary for macaroons.
pub trait MacaroonCodec: Send + Sync {
    fn deserialize(&self, raw: &str) -> Result<Box<dyn Macaroon>, AuthError>;
    fn serialize(&self, macaroon: &dyn Macaroon) -> Result<String, AuthError>;
}

pub type SharedCodec = Arc<dyn MacaroonCodec>;

/// Compose the user Authorization header: the root macaroon followed by each
/// discharge bound to the root's signature. Discharges that fail to
/// deserialize or re-serialize are logged and drop the remainder, matching a
/// best-effort header.
pub fn user_authorization(codec: &dyn MacaroonCodec, user: &UserCredentials) -> String {
    let root_raw = user.macaroon();
    let mut header = format!(r#"Macaroon root="{root_raw}""#);

    let root = match codec.deserialize(&root_raw) {
        Ok(m) => m,
        Err(err) => {
            debug!("cannot deserialize root macaroon: {err}");
            return header;
        }
    };
    let root_signature = root.signature();

    for raw in user.discharges() {
        let discharge = match codec.deserialize(&raw) {
            Ok(m) => m,
            Err(err) => {
                debug!("cannot deserialize discharge macaroon: {err}");
                return header;
            }
        };
        let bound = discharge.bind(&root_signature);
        match codec.serialize(bound.as_ref()) {
            Ok(serialized) => {
                header.push_str(&format!(r#", discharge="{serialized}""#));
            }
            Err(err) => {
                debug!("cannot re-serialize discharge macaroon: {err}");
                return header;
            }
        }
    }
    header
}

/// The device authorization header value for a session macaroon.
pub fn device_authorization(session_macaroon: &str) -> String {
    format!(r#"Macaroon root="{session_macaroon}""#)
}

/// Find the third-party caveat the SSO service must discharge.
pub fn login_caveat_id(root: &dyn Macaroon, sso_location: &str) -> Result<String, AuthError> {
    root.third_party_caveat_id(sso_location)
        .ok_or_else(|| AuthError::MissingLoginCaveat(sso_location.to_string()))
}

#[cfg(test)]
pub(crate) mod testing {
    //! A transparent fake codec: macaroons are `location|signature` strings
    //! and binding appends the root signature.

    use super::*;

    pub struct FakeMacaroon {
        pub location: String,
        pub signature: String,
        pub caveats: Vec<(String, String)>,
    }

    impl Macaroon for FakeMacaroon {
        fn location(&self) -> String {
            self.location.clone()
        }

        fn signature(&self) -> Vec<u8> {
            self.signature.clone().into_bytes()
        }

        fn third_party_caveat_id(&self, location: &str) -> Option<String> {
            self.caveats
                .iter()
                .find(|(loc, _)| loc == location)
                .map(|(_, id)| id.clone())
        }

        fn bind(&self, root_signature: &[u8]) -> Box<dyn Macaroon> {
            Box::new(FakeMacaroon {
                location: self.location.clone(),
                signature: format!(
                    "{}+{}",
                    self.signature,
                    String::from_utf8_lossy(root_signature)
                ),
                caveats: self.caveats.clone(),
            })
        }
    }

    pub struct FakeCodec;

    impl MacaroonCodec for FakeCodec {
        fn deserialize(&self, raw: &str) -> Result<Box<dyn Macaroon>, AuthError> {
            let (location, signature) = raw
                .split_once('|')
                .ok_or_else(|| AuthError::InvalidMacaroon(raw.to_string()))?;
            Ok(Box::new(FakeMacaroon {
                location: location.to_string(),
                signature: signature.to_string(),
                caveats: Vec::new(),
            }))
        }

        fn serialize(&self, macaroon: &dyn Macaroon) -> Result<String, AuthError> {
            Ok(format!(
                "{}|{}",
                macaroon.location(),
                String::from_utf8_lossy(&macaroon.signature())
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn user_authorization_binds_discharges() {
        let user = UserCredentials::new("store|rootsig", vec!["sso|dsig".to_string()]);
        let header = user_authorization(&FakeCodec, &user);
        assert_eq!(
            header,
            r#"Macaroon root="store|rootsig", discharge="sso|dsig+rootsig""#
        );
    }

    #[test]
    fn user_authorization_survives_bad_root() {
        let user = UserCredentials::new("garbage", vec!["sso|dsig".to_string()]);
        let header = user_authorization(&FakeCodec, &user);
        assert_eq!(header, r#"Macaroon root="garbage""#);
    }

    #[test]
    fn device_authorization_value() {
        assert_eq!(
            device_authorization("session-mac"),
            r#"Macaroon root="session-mac""#
        );
    }

    #[test]
    fn login_caveat_lookup() {
        let root = FakeMacaroon {
            location: "store".into(),
            signature: "sig".into(),
            caveats: vec![("login.ubuntu.com".into(), "caveat-123".into())],
        };
        assert_eq!(
            login_caveat_id(&root, "login.ubuntu.com").unwrap(),
            "caveat-123"
        );
        assert!(login_caveat_id(&root, "elsewhere").is_err());
    }
}
