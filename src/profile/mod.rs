//! Local profiles - offline accounts, each owning one dataset and one settings record

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::info;

use crate::db::{DurableMap, read_json, write_json};
use crate::error::{AuthError, Result, ValidationError};
use crate::model::{Dataset, Settings, new_id};

const PROFILES_KEY: &str = "profiles";
const ACTIVE_PROFILE_KEY: &str = "active_profile";

/// Recovery codes avoid look-alike characters (no I, O, 0, 1)
const RECOVERY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const RECOVERY_CODE_LEN: usize = 12;

/// One-way function used for passwords and recovery codes
pub trait OneWayDigest: Send + Sync {
    fn digest(&self, input: &str) -> String;

    fn verify(&self, input: &str, digest: &str) -> bool {
        self.digest(input) == digest
    }
}

/// SHA-256, hex encoded
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

impl OneWayDigest for Sha256Digest {
    fn digest(&self, input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"fitsync:");
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub password_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_code_digest: Option<String>,
    #[serde(default)]
    pub dataset: Dataset,
    #[serde(default)]
    pub settings: Settings,
    pub created_at: DateTime<Utc>,
}

/// Plaintext backup shown once at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryKit {
    pub username: String,
    pub code: String,
}

impl RecoveryKit {
    /// Read a kit back from its exported text
    pub fn parse(text: &str) -> Option<Self> {
        let mut username = None;
        let mut code = None;
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Username:") {
                username = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("Security Code:") {
                code = Some(rest.trim().to_string());
            }
        }

        match (username, code) {
            (Some(username), Some(code)) if !username.is_empty() && !code.is_empty() => {
                Some(Self { username, code })
            }
            _ => None,
        }
    }
}

impl fmt::Display for RecoveryKit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Username: {}\nSecurity Code: {}", self.username, self.code)
    }
}

/// Result of a successful registration. The kit is not stored anywhere.
#[derive(Debug, Clone)]
pub struct Registration {
    pub profile: Profile,
    pub recovery_kit: RecoveryKit,
}

pub fn generate_recovery_code() -> String {
    let mut rng = rand::thread_rng();
    (0..RECOVERY_CODE_LEN)
        .map(|_| RECOVERY_ALPHABET[rng.gen_range(0..RECOVERY_ALPHABET.len())] as char)
        .collect()
}

fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_uppercase()
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// All local profiles on this device
pub struct ProfileStore {
    map: Box<dyn DurableMap>,
    digest: Box<dyn OneWayDigest>,
    profiles: Vec<Profile>,
    active: Option<String>,
}

impl ProfileStore {
    pub fn open(map: Box<dyn DurableMap>) -> Result<Self> {
        Self::with_digest(map, Box::new(Sha256Digest))
    }

    pub fn with_digest(map: Box<dyn DurableMap>, digest: Box<dyn OneWayDigest>) -> Result<Self> {
        let mut store = Self {
            map,
            digest,
            profiles: Vec::new(),
            active: None,
        };
        store.reload()?;
        // whatever is on disk now is our baseline
        store.map.take_external_change()?;
        Ok(store)
    }

    pub fn map(&self) -> &dyn DurableMap {
        self.map.as_ref()
    }

    fn reload(&mut self) -> Result<()> {
        self.profiles = read_json(self.map.as_ref(), PROFILES_KEY)?.unwrap_or_default();
        self.active = read_json::<String>(self.map.as_ref(), ACTIVE_PROFILE_KEY)?
            .filter(|id| self.profiles.iter().any(|p| &p.id == id));
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        write_json(self.map.as_ref(), PROFILES_KEY, &self.profiles)
    }

    /// Reload everything if another tab or process wrote to the map
    pub fn refresh_if_changed(&mut self) -> Result<bool> {
        if self.map.take_external_change()? {
            self.reload()?;
            info!("Profiles reloaded after external change");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn find_by_name(&self, username: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| same_name(&p.name, username))
    }

    pub fn register(&mut self, username: &str, password: &str) -> Result<Registration> {
        self.refresh_if_changed()?;

        let username = username.trim();
        if username.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "username",
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        if password.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "password",
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        if self.find_by_name(username).is_some() {
            return Err(ValidationError::UsernameTaken.into());
        }

        let code = generate_recovery_code();
        let profile = Profile {
            id: new_id(),
            name: username.to_string(),
            password_digest: self.digest.digest(password),
            recovery_code_digest: Some(self.digest.digest(&code)),
            dataset: Dataset::default(),
            settings: Settings::default(),
            created_at: Utc::now(),
        };

        self.profiles.push(profile.clone());
        self.persist()?;
        info!("Registered profile {}", profile.id);

        Ok(Registration {
            recovery_kit: RecoveryKit {
                username: profile.name.clone(),
                code,
            },
            profile,
        })
    }

    /// Unknown user and wrong password fail the same way
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Profile, AuthError> {
        match self.find_by_name(username) {
            Some(profile) if self.digest.verify(password, &profile.password_digest) => {
                Ok(profile.clone())
            }
            Some(_) => Err(AuthError::InvalidCredentials),
            None => {
                // keep the work comparable to a real check
                let _ = self.digest.digest(password);
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    /// The code stays valid after use; it is never rotated automatically.
    pub fn reset_password(&mut self, username: &str, code: &str, new_password: &str) -> Result<bool> {
        self.refresh_if_changed()?;

        if new_password.is_empty() {
            return Ok(false);
        }
        let code = normalize_code(code);
        let Some(index) = self.profiles.iter().position(|p| same_name(&p.name, username)) else {
            return Ok(false);
        };
        let verified = self.profiles[index]
            .recovery_code_digest
            .as_deref()
            .is_some_and(|d| self.digest.verify(&code, d));
        if !verified {
            return Ok(false);
        }

        self.profiles[index].password_digest = self.digest.digest(new_password);
        self.persist()?;
        info!("Password reset for profile {}", self.profiles[index].id);
        Ok(true)
    }

    /// Reset using an exported recovery kit
    pub fn reset_password_with_kit(&mut self, kit_text: &str, new_password: &str) -> Result<bool> {
        match RecoveryKit::parse(kit_text) {
            Some(kit) => self.reset_password(&kit.username, &kit.code, new_password),
            None => Ok(false),
        }
    }

    /// Apply `updater` to one profile. Returns false if it no longer exists.
    pub fn update(&mut self, id: &str, updater: impl FnOnce(Profile) -> Profile) -> Result<bool> {
        self.refresh_if_changed()?;

        let Some(index) = self.profiles.iter().position(|p| p.id == id) else {
            return Ok(false);
        };
        let updated = updater(self.profiles[index].clone());
        self.profiles[index] = Profile {
            id: id.to_string(),
            ..updated
        };
        self.persist()?;
        Ok(true)
    }

    pub fn delete(&mut self, id: &str) -> Result<bool> {
        self.refresh_if_changed()?;

        let before = self.profiles.len();
        self.profiles.retain(|p| p.id != id);
        if self.profiles.len() == before {
            return Ok(false);
        }
        self.persist()?;
        if self.active.as_deref() == Some(id) {
            self.sign_out()?;
        }
        info!("Deleted profile {}", id);
        Ok(true)
    }

    pub fn active(&self) -> Option<&Profile> {
        self.active.as_deref().and_then(|id| self.get(id))
    }

    pub fn set_active(&mut self, id: &str) -> Result<()> {
        write_json(self.map.as_ref(), ACTIVE_PROFILE_KEY, id)?;
        self.active = Some(id.to_string());
        Ok(())
    }

    pub fn sign_out(&mut self) -> Result<()> {
        self.map.remove(ACTIVE_PROFILE_KEY)?;
        self.active = None;
        Ok(())
    }

    /// Full application reset: every profile and every cached dataset
    pub fn reset_all(&mut self) -> Result<()> {
        self.map.clear()?;
        self.profiles.clear();
        self.active = None;
        info!("Application data reset");
        Ok(())
    }
}
