// Caller-privilege filtering for rule visibility.
//
// The guard is applied wherever rule visibility is computed (the match
// scan and the rule-listing path share the same instance), so a denied
// rule is invisible, never merely blocked later.

use crate::context::CallerContext;
use crate::rule::AccessLevel;

/// Decides whether a rule at a given access level is visible to a caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGuard;

impl AccessGuard {
    pub fn new() -> Self {
        AccessGuard
    }

    /// Returns true if the caller may see rules at `required` level.
    ///
    /// - `Public` always permits.
    /// - `Authenticated` permits only non-anonymous callers.
    /// - `SuperAdmin` permits only callers holding the administrative
    ///   capability; anonymous callers are always denied here.
    pub fn permits(&self, required: AccessLevel, caller: &CallerContext) -> bool {
        match required {
            AccessLevel::Public => true,
            AccessLevel::Authenticated => !caller.is_anonymous(),
            AccessLevel::SuperAdmin => !caller.is_anonymous() && caller.is_admin,
        }
    }
}
