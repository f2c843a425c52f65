use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> anyhow::Result<()>;
}

/// Writes outgoing mail to the log instead of delivering it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> anyhow::Result<()> {
        tracing::info!(to = %email.to, subject = %email.subject, body = %email.html, "email");
        Ok(())
    }
}

// ── Templates ──

/// `{public_url}{path}?k=v&...` with every value url-encoded.
fn action_link(public_url: &str, path: &str, query: &[(&str, &str)]) -> String {
    let query = query
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}{path}?{query}", public_url.trim_end_matches('/'))
}

pub fn confirmation_link(public_url: &str, token: &str, email: &str) -> String {
    action_link(public_url, "/api/auth/confirm-email", &[("token", token), ("email", email)])
}

pub fn password_reset_link(public_url: &str, token: &str, email: &str) -> String {
    action_link(public_url, "/api/auth/reset-password", &[("email", email), ("token", token)])
}

pub fn email_change_link(public_url: &str, token: &str, old_email: &str, new_email: &str) -> String {
    action_link(
        public_url,
        "/api/auth/confirm-email-change",
        &[("token", token), ("oldEmail", old_email), ("newEmail", new_email)],
    )
}

pub fn registration_confirmation(to: &str, user_name: &str, link: &str) -> Email {
    let user_name = ammonia::clean_text(user_name);
    Email {
        to: to.to_string(),
        subject: "Confirm your email".into(),
        html: format!(
            "Hello {user_name},<br><br>\
             Kindly confirm your email by clicking on the link below:<br>\
             <a href='{link}'>Confirm Email</a><br><br>\
             Thank you!"
        ),
    }
}

pub fn password_reset(to: &str, user_name: &str, link: &str) -> Email {
    let user_name = ammonia::clean_text(user_name);
    Email {
        to: to.to_string(),
        subject: "Reset your password".into(),
        html: format!(
            "Hello {user_name},<br><br>\
             You requested to reset your password. Use the link below to choose a new one:<br>\
             <a href='{link}'>Reset Password</a><br><br>\
             If you did not request this, please ignore this email."
        ),
    }
}

pub fn email_change_confirmation(to: &str, user_name: &str, link: &str) -> Email {
    let user_name = ammonia::clean_text(user_name);
    Email {
        to: to.to_string(),
        subject: "Confirm your new email".into(),
        html: format!(
            "Hello {user_name},<br><br>\
             You requested to change your email. Please confirm the new address by clicking on the link below:<br>\
             <a href='{link}'>Confirm New Email</a><br><br>\
             If you did not request this, please contact support."
        ),
    }
}

pub fn new_post_notification(to: &str, user_name: &str, title: &str, link: &str) -> Email {
    let user_name = ammonia::clean_text(user_name);
    let title = ammonia::clean_text(title);
    Email {
        to: to.to_string(),
        subject: "Your new post is live".into(),
        html: format!(
            "<h2>Hello {user_name},</h2>\
             <p>You have successfully created a new post titled: <strong>{title}</strong>.</p>\
             <p>You can view your post <a href='{link}'>here</a>.</p>"
        ),
    }
}
