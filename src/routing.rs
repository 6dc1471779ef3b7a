//! C2 — the routing engine: a pure decision function.
//!
//! Holds no state between calls. `RuleCache` is an optional, separate
//! caller-side convenience layered on top — callers may cache the rule set
//! per squad with an invalidation hook fired on rule changes — not part of
//! the pure function's contract.

use crate::model::{Agent, Role, RoutingRule};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Resolves exactly one responder agent, or `None` (`NoResponder`), for the
/// given asker/question/escalation-level in squad `rules`/`agents`.
///
/// Deterministic: the same inputs against the same `rules`/`agents` always
/// produce the same output. Never panics; absence of a match is `None`, not
/// an error, leaving the caller to decide how to surface `NoResponder`.
pub fn route(
    rules: &[RoutingRule],
    agents: &[Agent],
    asker_role: Role,
    question_type: &str,
    escalation_level: i64,
    specialization_hint: Option<&str>,
) -> Option<Uuid> {
    // Step 1 + 2: active rules for this asker/escalation level.
    let candidates: Vec<&RoutingRule> = rules
        .iter()
        .filter(|r| r.active)
        .filter(|r| r.asker_role == asker_role && r.escalation_level == escalation_level)
        .collect();

    // Step 3: prefer an exact questionType match, else fall back to "default".
    let exact: Vec<&&RoutingRule> = candidates
        .iter()
        .filter(|r| r.question_type == question_type)
        .collect();
    let pool: Vec<&RoutingRule> = if !exact.is_empty() {
        exact.into_iter().copied().collect()
    } else {
        candidates
            .iter()
            .filter(|r| r.question_type == "default")
            .copied()
            .collect()
    };

    // Step 4: highest priority; tie-break by responderRole, then ruleId,
    // both lexicographic.
    let chosen = pool.into_iter().max_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.responder_role.as_str().cmp(a.responder_role.as_str()))
            .then_with(|| b.id.to_string().cmp(&a.id.to_string()))
    })?;

    // Step 5: resolve responderRole to an agent in the squad.
    let mut role_agents: Vec<&Agent> = agents
        .iter()
        .filter(|a| a.active && a.role == chosen.responder_role)
        .collect();
    if role_agents.is_empty() {
        return None;
    }
    if let Some(hint) = specialization_hint {
        if let Some(matching) = role_agents.iter().find(|a| a.specialization == hint) {
            return Some(matching.id);
        }
    }
    role_agents.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
    role_agents.first().map(|a| a.id)
}

/// A read-mostly per-squad rule-set cache with a generation counter bumped
/// on any write — the invalidation hook a caching layer can poll to know its
/// cached rule set is stale.
#[derive(Default)]
pub struct RuleCache {
    generations: HashMap<Uuid, Arc<AtomicU64>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation for a squad; callers compare this against the
    /// generation their cached copy was built at.
    pub fn generation(&mut self, squad_id: Uuid) -> u64 {
        self.generations
            .entry(squad_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .load(Ordering::Acquire)
    }

    /// Bumped by `SquadService`/the template applier on any `RoutingRule`
    /// write for this squad, invalidating cached rule sets.
    pub fn invalidate(&mut self, squad_id: Uuid) {
        self.generations
            .entry(squad_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        squad_id: Uuid,
        asker: Role,
        qtype: &str,
        level: i64,
        responder: Role,
        priority: i64,
    ) -> RoutingRule {
        RoutingRule {
            id: Uuid::new_v4(),
            squad_id,
            asker_role: asker,
            question_type: qtype.to_string(),
            escalation_level: level,
            responder_role: responder,
            priority,
            active: true,
        }
    }

    fn agent(squad_id: Uuid, role: Role, specialization: &str) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            squad_id,
            role,
            specialization: specialization.to_string(),
            generator_ref: String::new(),
            system_prompt: String::new(),
            tool_capabilities: vec![],
            active: true,
        }
    }

    #[test]
    fn resolves_exact_question_type_over_default() {
        let squad_id = Uuid::new_v4();
        let rules = vec![
            rule(
                squad_id,
                Role::BackendDeveloper,
                "default",
                0,
                Role::ProjectManager,
                1,
            ),
            rule(
                squad_id,
                Role::BackendDeveloper,
                "implementation",
                0,
                Role::TechLead,
                10,
            ),
        ];
        let tech_lead = agent(squad_id, Role::TechLead, "default");
        let agents = vec![tech_lead.clone(), agent(squad_id, Role::ProjectManager, "default")];

        let responder = route(
            &rules,
            &agents,
            Role::BackendDeveloper,
            "implementation",
            0,
            None,
        );
        assert_eq!(responder, Some(tech_lead.id));
    }

    #[test]
    fn no_matching_rule_is_no_responder() {
        let squad_id = Uuid::new_v4();
        let rules = vec![];
        let agents = vec![agent(squad_id, Role::TechLead, "default")];
        assert_eq!(
            route(&rules, &agents, Role::QaTester, "test_strategy", 0, None),
            None
        );
    }

    #[test]
    fn specialization_hint_breaks_ties_among_same_role_agents() {
        let squad_id = Uuid::new_v4();
        let rules = vec![rule(
            squad_id,
            Role::BackendDeveloper,
            "default",
            0,
            Role::TechLead,
            1,
        )];
        let python_lead = agent(squad_id, Role::TechLead, "python");
        let go_lead = agent(squad_id, Role::TechLead, "go");
        let agents = vec![go_lead.clone(), python_lead.clone()];

        let responder = route(
            &rules,
            &agents,
            Role::BackendDeveloper,
            "anything",
            0,
            Some("python"),
        );
        assert_eq!(responder, Some(python_lead.id));
    }

    #[test]
    fn without_hint_picks_lexicographically_smallest_agent_id() {
        let squad_id = Uuid::new_v4();
        let rules = vec![rule(
            squad_id,
            Role::BackendDeveloper,
            "default",
            0,
            Role::TechLead,
            1,
        )];
        let mut a = agent(squad_id, Role::TechLead, "a");
        let mut b = agent(squad_id, Role::TechLead, "b");
        if a.id > b.id {
            std::mem::swap(&mut a, &mut b);
        }
        let agents = vec![b.clone(), a.clone()];

        let responder = route(
            &rules,
            &agents,
            Role::BackendDeveloper,
            "anything",
            0,
            None,
        );
        assert_eq!(responder, Some(a.id));
    }

    #[test]
    fn priority_breaks_ties_between_competing_rules() {
        let squad_id = Uuid::new_v4();
        let rules = vec![
            rule(
                squad_id,
                Role::BackendDeveloper,
                "implementation",
                0,
                Role::TechLead,
                5,
            ),
            rule(
                squad_id,
                Role::BackendDeveloper,
                "implementation",
                0,
                Role::SolutionArchitect,
                10,
            ),
        ];
        let architect = agent(squad_id, Role::SolutionArchitect, "default");
        let agents = vec![agent(squad_id, Role::TechLead, "default"), architect.clone()];

        let responder = route(
            &rules,
            &agents,
            Role::BackendDeveloper,
            "implementation",
            0,
            None,
        );
        assert_eq!(responder, Some(architect.id));
    }
}
