//! Authorization: role/action policy and the kill switch.
//!
//! Every mutating entry point in this crate takes a [`Caller`] and goes
//! through [`Gate::authorize`], which runs two independent checks:
//!
//! 1. the injected [`PermissionChecker`] must allow the action, and
//! 2. the [`KillSwitch`], when armed for the caller's environment, must see
//!    the right confirmation token for destructive actions.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Role hierarchy. Ordering is privilege: `Viewer < Operator < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(Error::Config(format!("unknown role '{}'", other))),
        }
    }
}

/// Something a caller can ask to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ViewTriggers,
    EnableTrigger,
    DisableTrigger,
    ApplyTrigger,
    GenerateTrigger,
    DropTrigger,
    ExecuteSql,
    ApplyMigration,
    RollbackMigration,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::ViewTriggers,
        Action::EnableTrigger,
        Action::DisableTrigger,
        Action::ApplyTrigger,
        Action::GenerateTrigger,
        Action::DropTrigger,
        Action::ExecuteSql,
        Action::ApplyMigration,
        Action::RollbackMigration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::ViewTriggers => "view_triggers",
            Action::EnableTrigger => "enable_trigger",
            Action::DisableTrigger => "disable_trigger",
            Action::ApplyTrigger => "apply_trigger",
            Action::GenerateTrigger => "generate_trigger",
            Action::DropTrigger => "drop_trigger",
            Action::ExecuteSql => "execute_sql",
            Action::ApplyMigration => "apply_migration",
            Action::RollbackMigration => "rollback_migration",
        }
    }

    /// The least privileged role allowed to perform this action.
    pub fn required_role(self) -> Role {
        match self {
            Action::ViewTriggers => Role::Viewer,
            Action::EnableTrigger
            | Action::DisableTrigger
            | Action::ApplyTrigger
            | Action::GenerateTrigger
            | Action::ApplyMigration => Role::Operator,
            Action::DropTrigger | Action::ExecuteSql | Action::RollbackMigration => Role::Admin,
        }
    }

    /// The text a caller must supply to get past an armed kill switch.
    pub fn confirmation_token(self) -> String {
        format!("EXECUTE {}", self.as_str().to_ascii_uppercase())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == wanted)
            .ok_or_else(|| Error::Config(format!("unknown action '{}'", s.trim())))
    }
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Free-form actor type, e.g. `user`, `service`, `console`.
    pub kind: String,
    pub id: Option<String>,
    pub role: Option<Role>,
}

impl Actor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            role: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.kind, id),
            None => f.write_str(&self.kind),
        }
    }
}

/// The full context of a request: actor, environment, and an optional
/// kill-switch confirmation.
#[derive(Debug, Clone)]
pub struct Caller {
    pub actor: Actor,
    pub environment: Option<String>,
    pub confirmation: Option<String>,
}

impl Caller {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            environment: None,
            confirmation: None,
        }
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn confirm(mut self, token: impl Into<String>) -> Self {
        self.confirmation = Some(token.into());
        self
    }
}

/// Decides whether an actor may perform an action.
pub trait PermissionChecker: Send + Sync {
    fn can(&self, actor: &Actor, action: Action, environment: Option<&str>) -> bool;
}

impl<F> PermissionChecker for F
where
    F: Fn(&Actor, Action, Option<&str>) -> bool + Send + Sync,
{
    fn can(&self, actor: &Actor, action: Action, environment: Option<&str>) -> bool {
        self(actor, action, environment)
    }
}

/// Allows everything. Use it when authorization happens somewhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn can(&self, _actor: &Actor, _action: Action, _environment: Option<&str>) -> bool {
        true
    }
}

/// Grants an action when the actor's role is at least the action's
/// required role. Actors without a role get nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleChecker;

impl PermissionChecker for RoleChecker {
    fn can(&self, actor: &Actor, action: Action, _environment: Option<&str>) -> bool {
        actor.role.is_some_and(|role| role >= action.required_role())
    }
}

/// Blocks destructive actions unless explicitly confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSwitch {
    pub enabled: bool,
    /// Environments the switch applies to; empty means every environment.
    pub environments: Vec<String>,
    pub actions: Vec<Action>,
}

impl KillSwitch {
    /// The default armed switch, blocking drops, raw SQL and rollbacks everywhere.
    pub fn armed() -> Self {
        Self {
            enabled: true,
            environments: Vec::new(),
            actions: vec![
                Action::DropTrigger,
                Action::ExecuteSql,
                Action::RollbackMigration,
            ],
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            environments: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Restrict the switch to the given environments.
    pub fn only_in<I, S>(mut self, environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = environments.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `action` is blocked in `environment` (before confirmation).
    pub fn blocks(&self, action: Action, environment: Option<&str>) -> bool {
        if !self.enabled || !self.actions.contains(&action) {
            return false;
        }
        if self.environments.is_empty() {
            return true;
        }
        environment.is_some_and(|env| self.environments.iter().any(|e| e == env))
    }

    /// Fail unless the action is unblocked or the caller confirmed it.
    pub fn check(&self, action: Action, caller: &Caller) -> Result<()> {
        if !self.blocks(action, caller.environment.as_deref()) {
            return Ok(());
        }

        let expected = action.confirmation_token();
        if caller.confirmation.as_deref().map(str::trim) == Some(expected.as_str()) {
            tracing::info!(
                action = %action,
                actor = %caller.actor,
                environment = caller.environment.as_deref().unwrap_or("-"),
                "kill switch override confirmed"
            );
            return Ok(());
        }

        tracing::warn!(
            action = %action,
            actor = %caller.actor,
            environment = caller.environment.as_deref().unwrap_or("-"),
            "kill switch blocked action"
        );
        Err(Error::KillSwitch {
            action,
            environment: caller.environment.clone(),
            expected,
        })
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Permission checker plus kill switch.
pub struct Gate {
    checker: Box<dyn PermissionChecker>,
    kill_switch: KillSwitch,
}

impl Gate {
    /// A gate backed by `checker`, with the kill switch disarmed.
    pub fn new(checker: impl PermissionChecker + 'static) -> Self {
        Self {
            checker: Box::new(checker),
            kill_switch: KillSwitch::disabled(),
        }
    }

    /// A gate that allows everything and has no kill switch.
    pub fn allow_all() -> Self {
        Self::new(AllowAll)
    }

    pub fn with_kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = kill_switch;
        self
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn can(&self, actor: &Actor, action: Action, environment: Option<&str>) -> bool {
        self.checker.can(actor, action, environment)
    }

    /// Fail with a permission error if the checker refuses.
    pub fn check(&self, actor: &Actor, action: Action, environment: Option<&str>) -> Result<()> {
        if self.can(actor, action, environment) {
            return Ok(());
        }
        tracing::warn!(action = %action, actor = %actor, "permission denied");
        Err(Error::Permission {
            action,
            required: action.required_role(),
        })
    }

    /// Permission check, then kill switch.
    pub fn authorize(&self, caller: &Caller, action: Action) -> Result<()> {
        self.check(&caller.actor, action, caller.environment.as_deref())?;
        self.kill_switch.check(action, caller)
    }
}

/// Allows everything; the embedding system is expected to supply real policy.
impl Default for Gate {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("kill_switch", &self.kill_switch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(role: Role) -> Caller {
        Caller::new(Actor::new("user").id("42").role(role))
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Viewer < Role::Operator);
        assert!(Role::Operator < Role::Admin);
    }

    #[test]
    fn test_action_table() {
        assert_eq!(Action::ViewTriggers.required_role(), Role::Viewer);
        assert_eq!(Action::ApplyTrigger.required_role(), Role::Operator);
        assert_eq!(Action::GenerateTrigger.required_role(), Role::Operator);
        assert_eq!(Action::DropTrigger.required_role(), Role::Admin);
        assert_eq!(Action::ExecuteSql.required_role(), Role::Admin);
        assert_eq!(Action::ApplyMigration.required_role(), Role::Operator);
        assert_eq!(Action::RollbackMigration.required_role(), Role::Admin);
    }

    #[test]
    fn test_action_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("launch_missiles".parse::<Action>().is_err());
    }

    #[test]
    fn test_allow_all() {
        let gate = Gate::allow_all();
        let nobody = Actor::new("anonymous");
        for action in Action::ALL {
            assert!(gate.can(&nobody, action, None));
        }
    }

    #[test]
    fn test_role_checker() {
        let gate = Gate::new(RoleChecker);
        let operator = caller(Role::Operator);

        assert!(gate.authorize(&operator, Action::ApplyTrigger).is_ok());
        assert!(gate.authorize(&operator, Action::ViewTriggers).is_ok());

        let err = gate.authorize(&operator, Action::DropTrigger).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Permission denied: drop_trigger requires admin role"
        );

        assert!(!gate.can(&Actor::new("anonymous"), Action::ViewTriggers, None));
    }

    #[test]
    fn test_closure_checker() {
        let gate = Gate::new(|actor: &Actor, _action: Action, env: Option<&str>| {
            actor.kind == "service" && env != Some("production")
        });
        let service = Actor::new("service");
        assert!(gate.can(&service, Action::ExecuteSql, Some("staging")));
        assert!(!gate.can(&service, Action::ExecuteSql, Some("production")));
    }

    #[test]
    fn test_kill_switch_blocks_without_confirmation() {
        let gate = Gate::allow_all().with_kill_switch(KillSwitch::armed());
        let admin = caller(Role::Admin).environment("production");

        let err = gate.authorize(&admin, Action::DropTrigger).unwrap_err();
        assert!(matches!(err, Error::KillSwitch { .. }));
        assert_eq!(
            err.to_string(),
            "kill switch is active for drop_trigger in production; confirm with 'EXECUTE DROP_TRIGGER' to override"
        );

        // Not a kill-switch action.
        assert!(gate.authorize(&admin, Action::ApplyTrigger).is_ok());
    }

    #[test]
    fn test_kill_switch_confirmation() {
        let gate = Gate::allow_all().with_kill_switch(KillSwitch::armed());
        let confirmed = caller(Role::Admin).confirm("EXECUTE DROP_TRIGGER");
        assert!(gate.authorize(&confirmed, Action::DropTrigger).is_ok());

        let wrong = caller(Role::Admin).confirm("EXECUTE EXECUTE_SQL");
        assert!(gate.authorize(&wrong, Action::DropTrigger).is_err());
    }

    #[test]
    fn test_kill_switch_environments() {
        let switch = KillSwitch::armed().only_in(["production"]);
        assert!(switch.blocks(Action::DropTrigger, Some("production")));
        assert!(!switch.blocks(Action::DropTrigger, Some("development")));
        assert!(!switch.blocks(Action::DropTrigger, None));
        assert!(!KillSwitch::disabled().blocks(Action::DropTrigger, Some("production")));
    }

    #[test]
    fn test_permission_runs_before_kill_switch() {
        let gate = Gate::new(RoleChecker).with_kill_switch(KillSwitch::armed());
        let viewer = caller(Role::Viewer).confirm("EXECUTE DROP_TRIGGER");
        let err = gate.authorize(&viewer, Action::DropTrigger).unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
    }
}
