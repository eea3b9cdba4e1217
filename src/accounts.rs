//! Users registered through the demo signup form.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

const SIGNUP_PAGE: &str = "signup/index.html";
const LOGIN_PAGE: &str = "login/index.html";
const LOGIN_OK_PAGE: &str = "upload.html";
const LOGIN_FAILED_PAGE: &str = "login_failed.html";

/// Username to password. Starts empty and is lost on restart.
#[derive(Debug, Default)]
pub struct Accounts {
    users: HashMap<String, String>,
}

impl Accounts {
    /// Apply a form posted to `target` and return the page to answer with.
    pub fn submit(&mut self, target: &Path, form: &[(String, String)]) -> PathBuf {
        let target = if target.is_dir() {
            target.join("index.html")
        } else {
            target.to_path_buf()
        };
        let field = |name: &str| {
            form.iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };

        if target.ends_with(SIGNUP_PAGE) {
            if let (Some(username), Some(password)) = (field("username"), field("password")) {
                if !username.is_empty() {
                    tracing::info!("registered user `{}'", username);
                    self.users
                        .insert(username.to_string(), password.to_string());
                }
            }
            return target;
        }

        if target.ends_with(LOGIN_PAGE) {
            let accepted = match (field("username"), field("password")) {
                (Some(username), Some(password)) => {
                    self.users.get(username).map(String::as_str) == Some(password)
                }
                _ => false,
            };
            let page = if accepted {
                LOGIN_OK_PAGE
            } else {
                LOGIN_FAILED_PAGE
            };
            return target.with_file_name(page);
        }

        target
    }
}
