use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::password::{hash_password, verify_password};
use super::policy::{require_active, require_admin};
use super::{Engine, EngineError};

fn validate_email(email: &str) -> Result<(), EngineError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("e-mail too long"));
    }
    let well_formed = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !well_formed {
        return Err(EngineError::Invalid(format!("{email:?} is not a valid e-mail address")));
    }
    Ok(())
}

pub(crate) fn validate_password(password: &str, email: &str) -> Result<(), EngineError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(EngineError::Invalid(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(EngineError::LimitExceeded("password too long"));
    }
    if password.contains(email) {
        return Err(EngineError::Invalid("password must not contain the e-mail".into()));
    }
    Ok(())
}

impl Engine {
    /// Administrators add accounts; there is no self sign-up over the wire.
    pub async fn register_user(
        &self,
        identity: &Identity,
        email: String,
        password: String,
        is_superuser: bool,
    ) -> Result<User, EngineError> {
        require_admin(identity)?;
        self.insert_user(email, password, is_superuser).await
    }

    /// Create the bootstrap administrator unless the e-mail is already taken.
    /// Returns the new user, or `None` when nothing was done.
    pub async fn ensure_superuser(&self, email: &str, password: &str) -> Result<Option<User>, EngineError> {
        match self.insert_user(email.to_string(), password.to_string(), true).await {
            Ok(user) => Ok(Some(user)),
            Err(EngineError::DuplicateEmail(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert_user(&self, email: String, password: String, is_superuser: bool) -> Result<User, EngineError> {
        validate_email(&email)?;
        validate_password(&password, &email)?;
        let password_hash = hash_password(&password)?;

        let _gate = self.begin_write().await;
        let mut emails = self.user_emails.lock().await;
        if emails.contains_key(&email) {
            return Err(EngineError::DuplicateEmail(email));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let id = self.next_user_id();
        let event = Event::UserRegistered {
            id,
            email: email.clone(),
            password_hash: password_hash.clone(),
            is_superuser,
        };
        self.wal_append(&event).await?;
        let user = User {
            id,
            email,
            password_hash,
            is_active: true,
            is_superuser,
        };
        emails.insert(user.email.clone(), id);
        self.users.insert(id, user.clone());
        info!("user {id} registered: {}", user.email);
        Ok(user)
    }

    /// Users may change their own password; anything else needs an administrator.
    pub async fn update_user(&self, identity: &Identity, id: UserId, patch: UserPatch) -> Result<User, EngineError> {
        require_active(identity)?;
        if identity.id != id || !patch.is_self_service() {
            require_admin(identity)?;
        }

        let _gate = self.begin_write().await;
        let _emails = self.user_emails.lock().await;
        let existing = self
            .users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::user_not_found(id))?;
        let mut merged = patch.apply(&existing);
        if let Some(password) = &patch.password {
            validate_password(password, &existing.email)?;
            merged.password_hash = hash_password(password)?;
        }
        if merged == existing {
            return Ok(merged);
        }
        let event = Event::UserUpdated {
            id,
            password_hash: merged.password_hash.clone(),
            is_active: merged.is_active,
            is_superuser: merged.is_superuser,
        };
        self.wal_append(&event).await?;
        self.users.insert(id, merged.clone());
        info!("user {id} updated");
        Ok(merged)
    }

    pub fn get_user(&self, identity: &Identity, id: UserId) -> Result<User, EngineError> {
        require_active(identity)?;
        if identity.id != id {
            require_admin(identity)?;
        }
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::user_not_found(id))
    }

    /// Administrators see everyone; other users see only themselves.
    pub fn list_users(&self, identity: &Identity) -> Result<Vec<User>, EngineError> {
        require_active(identity)?;
        let mut users: Vec<User> = if identity.is_superuser {
            self.users.iter().map(|u| u.value().clone()).collect()
        } else {
            self.users.get(&identity.id).map(|u| u.value().clone()).into_iter().collect()
        };
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    /// Login lookup. Unauthenticated callers use this, so it takes no identity.
    pub async fn user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.user_emails.lock().await.get(email)?;
        self.users.get(&id).map(|u| u.value().clone())
    }

    /// Check a login against the stored hash. Unknown, inactive and
    /// wrong-password logins all come back as `Unauthenticated`.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Identity, EngineError> {
        let user = self.user_by_email(email).await.ok_or(EngineError::Unauthenticated)?;
        let hash = user.password_hash.clone();
        let password = password.to_string();
        let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .unwrap_or(false);
        if matches && user.is_active {
            Ok(user.identity())
        } else {
            Err(EngineError::Unauthenticated)
        }
    }
}
