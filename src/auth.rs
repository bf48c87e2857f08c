
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ring::hmac;

/// Token-based authentication collaborator.
///
/// Two modes, mirroring the gateway configuration: a stored-token set
/// managed via the admin surface, or stateless signed tokens of the form
/// `realm,expiry[,descriptor...]:::hex(hmac-sha1(data))`. When disabled,
/// every token is accepted.
pub struct TokenAuth {
    enabled: bool,
    signing_key: Option<hmac::Key>,
    stored: Mutex<HashMap<String, Option<SystemTime>>>,
}

impl TokenAuth {
    pub fn disabled() -> Self {
        TokenAuth {
            enabled: false,
            signing_key: None,
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// Stored-token mode: only explicitly added tokens are valid.
    pub fn stored_tokens() -> Self {
        TokenAuth {
            enabled: true,
            signing_key: None,
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// Signed-token mode with the shared secret from the configuration.
    pub fn signed_tokens(secret: &str) -> Self {
        TokenAuth {
            enabled: true,
            signing_key: Some(hmac::Key::new(
                hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
                secret.as_bytes(),
            )),
            stored: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn uses_signed_tokens(&self) -> bool {
        self.signing_key.is_some()
    }

    pub fn add_token(&self, token: &str, expires: Option<SystemTime>) {
        let mut stored = self.stored.lock().unwrap();
        stored.insert(token.to_owned(), expires);
    }

    pub fn remove_token(&self, token: &str) {
        let mut stored = self.stored.lock().unwrap();
        stored.remove(token);
    }

    /// Drops stored tokens past their expiry; driven by the gateway
    /// watchdog.
    pub fn sweep(&self, now: SystemTime) {
        let mut stored = self.stored.lock().unwrap();
        stored.retain(|_, expires| expires.map(|e| e > now).unwrap_or(true));
    }

    /// Checks a token against the stored set (stored-token mode) or its
    /// signature with realm `gateway` (signed mode).
    pub fn check_token(&self, token: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if self.signing_key.is_some() {
            return self.check_signature(token, "gateway", None);
        }
        let stored = self.stored.lock().unwrap();
        match stored.get(token) {
            Some(Some(expires)) => *expires > SystemTime::now(),
            Some(None) => true,
            None => false,
        }
    }

    /// Checks a signed token against a plugin realm.
    pub fn is_signature_valid(&self, realm: &str, token: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.check_signature(token, realm, None)
    }

    /// Checks a signed token against a plugin realm and requires the
    /// descriptor to be granted by it.
    pub fn signature_contains(&self, realm: &str, token: &str, descriptor: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.check_signature(token, realm, Some(descriptor))
    }

    /// Signs a token for `realm` with the given lifetime and descriptors;
    /// test and admin helper.
    pub fn sign(&self, realm: &str, lifetime: Duration, descriptors: &[&str]) -> Option<String> {
        let key = self.signing_key.as_ref()?;
        let expiry = (SystemTime::now() + lifetime)
            .duration_since(UNIX_EPOCH)
            .ok()?
            .as_secs();
        let mut data = format!("{realm},{expiry}");
        for d in descriptors {
            data.push(',');
            data.push_str(d);
        }
        let tag = hmac::sign(key, data.as_bytes());
        Some(format!("{data}:::{}", hex::encode(tag.as_ref())))
    }

    fn check_signature(&self, token: &str, realm: &str, descriptor: Option<&str>) -> bool {
        let key = match &self.signing_key {
            Some(key) => key,
            None => return false,
        };
        let (data, signature) = match token.split_once(":::") {
            Some(parts) => parts,
            None => return false,
        };
        let signature = match hex::decode(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        if hmac::verify(key, data.as_bytes(), &signature).is_err() {
            return false;
        }

        let mut fields = data.split(',');
        if fields.next() != Some(realm) {
            return false;
        }
        let expiry = match fields.next().and_then(|e| e.parse::<u64>().ok()) {
            Some(e) => e,
            None => return false,
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(u64::MAX);
        if expiry <= now {
            return false;
        }
        match descriptor {
            Some(d) => fields.any(|f| f == d),
            None => true,
        }
    }
}
