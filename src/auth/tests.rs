//! Auth module tests

use super::*;
use crate::config::{AuthConfig, UserConfig};

fn make_auth_config(enabled: bool, allow_anonymous: bool, users: Vec<UserConfig>) -> AuthConfig {
    AuthConfig {
        enabled,
        allow_anonymous,
        users,
    }
}

fn make_user(username: &str, password: &str) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: password.to_string(),
    }
}

#[tokio::test]
async fn test_auth_disabled_allows_all() {
    let config = make_auth_config(false, false, vec![]);
    let provider = AuthProvider::new(&config);

    assert!(!provider.is_enabled());
    assert!(
        provider
            .check_valid("client1", Some("user"), Some(b"pass"))
            .await,
        "Should allow when auth is disabled"
    );
}

#[tokio::test]
async fn test_auth_enabled_rejects_unknown_user() {
    let config = make_auth_config(true, false, vec![make_user("admin", "secret")]);
    let provider = AuthProvider::new(&config);

    assert!(
        !provider
            .check_valid("client1", Some("unknown"), Some(b"pass"))
            .await,
        "Should reject unknown user"
    );
}

#[tokio::test]
async fn test_auth_enabled_rejects_wrong_password() {
    let config = make_auth_config(true, false, vec![make_user("admin", "secret")]);
    let provider = AuthProvider::new(&config);

    assert!(
        !provider
            .check_valid("client1", Some("admin"), Some(b"wrong"))
            .await,
        "Should reject wrong password"
    );
}

#[tokio::test]
async fn test_auth_enabled_accepts_valid_credentials() {
    let config = make_auth_config(true, false, vec![make_user("admin", "secret")]);
    let provider = AuthProvider::new(&config);

    assert!(
        provider
            .check_valid("client1", Some("admin"), Some(b"secret"))
            .await
    );
}

#[tokio::test]
async fn test_auth_missing_password_rejected() {
    let config = make_auth_config(true, false, vec![make_user("admin", "secret")]);
    let provider = AuthProvider::new(&config);

    assert!(!provider.check_valid("client1", Some("admin"), None).await);
}

#[tokio::test]
async fn test_anonymous_policy() {
    let strict = AuthProvider::new(&make_auth_config(true, false, vec![]));
    assert!(!strict.check_valid("client1", None, None).await);

    let lenient = AuthProvider::new(&make_auth_config(true, true, vec![]));
    assert!(lenient.check_valid("client1", None, None).await);
}

#[tokio::test]
async fn test_allow_all() {
    assert!(AllowAll.check_valid("c", None, None).await);
}
