/*!
 * # Permissions Module
 *
 * Permissions are `resource:action` strings. Tokens minted by other
 * issuers sometimes use `resource.action`; both spellings are accepted.
 */

/// Permission actions
pub struct Actions;

impl Actions {
    pub const READ: &'static str = "read";
    pub const CREATE: &'static str = "create";
    pub const UPDATE: &'static str = "update";
    pub const DELETE: &'static str = "delete";
    pub const UNMASK: &'static str = "unmask";
}

/// Resource types
pub struct Resources;

impl Resources {
    pub const CUSTOMER: &'static str = "customer";
    pub const ACCOUNT: &'static str = "account";
    pub const CARD: &'static str = "card";
}

/// Common permission string constants for compile-time safety
pub mod consts {
    // Customers
    pub const CUSTOMER_READ: &str = "customer:read";
    pub const CUSTOMER_CREATE: &str = "customer:create";
    pub const CUSTOMER_UPDATE: &str = "customer:update";
    pub const CUSTOMER_DELETE: &str = "customer:delete";

    // Accounts
    pub const ACCOUNT_READ: &str = "account:read";
    pub const ACCOUNT_CREATE: &str = "account:create";
    pub const ACCOUNT_UPDATE: &str = "account:update";
    pub const ACCOUNT_DELETE: &str = "account:delete";

    // Cards
    pub const CARD_READ: &str = "card:read";
    pub const CARD_CREATE: &str = "card:create";
    pub const CARD_UPDATE: &str = "card:update";
    pub const CARD_DELETE: &str = "card:delete";
    /// Read PAN and CVV in clear.
    pub const CARD_UNMASK: &str = "card:unmask";

    pub const ADMIN_ROLE: &str = "admin";
}

/// Canonical `resource:action` spelling of a granted permission.
pub fn normalize(permission: &str) -> String {
    permission.trim().replacen('.', ":", 1)
}

/// Builds `resource:action`.
pub fn permission(resource: &str, action: &str) -> String {
    format!("{}:{}", resource, action)
}
