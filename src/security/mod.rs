mod admin_auth;

pub use admin_auth::{require_admin, AdminAuth, AdminCaller, AuthRejection};
