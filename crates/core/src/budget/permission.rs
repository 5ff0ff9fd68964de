//! Budget access control.
//!
//! The engine itself never checks permissions; callers consult a
//! [`BudgetPermissions`] implementation before invoking an operation.
//! [`RolePolicy`] is the role-based implementation used by the care platform:
//!
//! - power of attorney and family members view the budget of their own patient
//! - administrators can do everything
//! - managers with an active authorization for the patient can view and change it
//! - workers with an active authorization can view it

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Permission checks for budget operations.
pub trait BudgetPermissions: Send + Sync {
    /// Whether the actor may read the patient's budget.
    fn can_view(&self, actor_id: &str, patient_id: &str) -> bool;
    /// Whether the actor may create the patient's budget.
    fn can_create(&self, actor_id: &str, patient_id: &str) -> bool;
    /// Whether the actor may replace or adjust the patient's budget.
    fn can_update(&self, actor_id: &str, patient_id: &str) -> bool;
    /// Whether the actor may delete the patient's budget.
    fn can_delete(&self, actor_id: &str, patient_id: &str) -> bool;
    /// Whether the actor may add, change, remove or reallocate items.
    fn can_manage_items(&self, actor_id: &str, patient_id: &str) -> bool;
    /// Whether the actor may record usage and refunds.
    fn can_update_usage(&self, actor_id: &str, patient_id: &str) -> bool;
}

/// Kind of platform user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserType {
    /// Holds power of attorney for a patient.
    #[serde(rename = "POA")]
    PowerOfAttorney,
    /// Family member of a patient.
    #[serde(rename = "FM")]
    FamilyMember,
    /// Care manager of an organization.
    #[serde(rename = "MANAGER")]
    Manager,
    /// Care worker of an organization.
    #[serde(rename = "WORKER")]
    Worker,
    /// Anything else.
    #[serde(rename = "OTHER")]
    Other,
}

impl UserType {
    /// Parses a user type code. Unknown codes map to `Other`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "POA" => Self::PowerOfAttorney,
            "FM" => Self::FamilyMember,
            "MANAGER" => Self::Manager,
            "WORKER" => Self::Worker,
            _ => Self::Other,
        }
    }

    /// Returns the user type code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PowerOfAttorney => "POA",
            Self::FamilyMember => "FM",
            Self::Manager => "MANAGER",
            Self::Worker => "WORKER",
            Self::Other => "OTHER",
        }
    }

    const fn is_patient_side(self) -> bool {
        matches!(self, Self::PowerOfAttorney | Self::FamilyMember)
    }
}

/// A user as seen by the permission policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    /// User ID.
    pub user_id: String,
    /// User type.
    pub user_type: UserType,
    /// Platform administrator.
    #[serde(default)]
    pub is_admin: bool,
    /// Patient the user represents (POA and family members).
    #[serde(default)]
    pub patient_id: Option<String>,
    /// Organization the user works for (managers and workers).
    #[serde(default)]
    pub organization_id: Option<String>,
}

/// Grant of access to one patient for a staff member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// User the grant is for.
    pub authorized_to: String,
    /// Patient the grant covers.
    pub patient_id: String,
    /// Organization issuing the grant.
    pub organization_id: String,
    /// Revoked grants stay on record as inactive.
    pub is_active: bool,
}

/// Role-based [`BudgetPermissions`] over a snapshot of users and grants.
///
/// Unknown actors are denied everything.
#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    actors: HashMap<String, Actor>,
    authorizations: Vec<Authorization>,
}

impl RolePolicy {
    /// Creates a policy from users and their authorizations.
    #[must_use]
    pub fn new(
        actors: impl IntoIterator<Item = Actor>,
        authorizations: impl IntoIterator<Item = Authorization>,
    ) -> Self {
        Self {
            actors: actors
                .into_iter()
                .map(|a| (a.user_id.clone(), a))
                .collect(),
            authorizations: authorizations.into_iter().collect(),
        }
    }

    /// Patients whose budget the actor can see, in grant order.
    ///
    /// Administrators are not listed against every patient; check
    /// [`Self::is_budget_administrator`] for them.
    #[must_use]
    pub fn accessible_patients(&self, actor_id: &str) -> Vec<String> {
        let Some(actor) = self.actors.get(actor_id) else {
            return Vec::new();
        };

        let mut patients = Vec::new();
        if actor.user_type.is_patient_side() {
            if let Some(patient_id) = &actor.patient_id {
                patients.push(patient_id.clone());
            }
        }
        if matches!(actor.user_type, UserType::Manager | UserType::Worker) {
            for grant in self
                .authorizations
                .iter()
                .filter(|g| g.is_active && g.authorized_to == actor.user_id)
            {
                if !patients.contains(&grant.patient_id) {
                    patients.push(grant.patient_id.clone());
                }
            }
        }
        patients
    }

    /// Whether the actor administers budgets (managers and administrators).
    #[must_use]
    pub fn is_budget_administrator(&self, actor_id: &str) -> bool {
        self.actors
            .get(actor_id)
            .is_some_and(|a| a.is_admin || a.user_type == UserType::Manager)
    }

    fn has_active_authorization(&self, actor: &Actor, patient_id: &str) -> bool {
        let Some(organization_id) = actor.organization_id.as_deref() else {
            return false;
        };
        self.authorizations.iter().any(|g| {
            g.is_active
                && g.authorized_to == actor.user_id
                && g.patient_id == patient_id
                && g.organization_id == organization_id
        })
    }

    fn manager_may_change(&self, actor_id: &str, patient_id: &str) -> bool {
        let Some(actor) = self.actors.get(actor_id) else {
            return false;
        };
        actor.is_admin
            || (actor.user_type == UserType::Manager
                && self.has_active_authorization(actor, patient_id))
    }
}

impl BudgetPermissions for RolePolicy {
    fn can_view(&self, actor_id: &str, patient_id: &str) -> bool {
        let Some(actor) = self.actors.get(actor_id) else {
            return false;
        };
        if actor.is_admin {
            return true;
        }
        match actor.user_type {
            UserType::PowerOfAttorney | UserType::FamilyMember => {
                actor.patient_id.as_deref() == Some(patient_id)
            }
            UserType::Manager | UserType::Worker => {
                self.has_active_authorization(actor, patient_id)
            }
            UserType::Other => false,
        }
    }

    fn can_create(&self, actor_id: &str, patient_id: &str) -> bool {
        self.manager_may_change(actor_id, patient_id)
    }

    fn can_update(&self, actor_id: &str, patient_id: &str) -> bool {
        self.manager_may_change(actor_id, patient_id)
    }

    fn can_delete(&self, actor_id: &str, patient_id: &str) -> bool {
        self.manager_may_change(actor_id, patient_id)
    }

    fn can_manage_items(&self, actor_id: &str, patient_id: &str) -> bool {
        self.manager_may_change(actor_id, patient_id)
    }

    fn can_update_usage(&self, actor_id: &str, patient_id: &str) -> bool {
        self.manager_may_change(actor_id, patient_id)
    }
}
