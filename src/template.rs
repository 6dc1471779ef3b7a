//! C6 — atomic squad instantiation from a [`SquadTemplate`].
//!
//! `applyTemplate` runs as a single transaction over the same pool
//! [`Repo`] already shares with [`crate::store::EventStore`]: either every
//! agent/rule a template names lands, or none does — an all-or-nothing
//! multi-row relational commit rather than a partial, inconsistent squad.

use crate::error::{Error, Result};
use crate::model::{Role, Squad, SquadTemplate, TemplateCustomization};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use uuid::Uuid;

pub struct TemplateService {
    pool: SqlitePool,
}

impl TemplateService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Parses the declarative template file format. YAML is a superset of
    /// JSON for `serde_yaml`'s purposes, so this is also the parser the
    /// HTTP layer uses for a JSON-bodied registration — one parser for one
    /// format.
    pub fn parse_yaml(raw: &str) -> Result<SquadTemplate> {
        serde_yaml::from_str(raw).map_err(|e| Error::Invalid(format!("invalid template: {e}")))
    }

    pub async fn save_template(&self, template: &SquadTemplate) -> Result<()> {
        validate_template(template)?;
        let body = serde_json::to_string(template)
            .map_err(|e| Error::Invalid(format!("template not serializable: {e}")))?;
        sqlx::query(
            "INSERT INTO templates (slug, name, description, version, body) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(slug) DO UPDATE SET name = excluded.name, description = excluded.description, \
             version = excluded.version, body = excluded.body",
        )
        .bind(&template.slug)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.version)
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_template(&self, slug: &str) -> Result<SquadTemplate> {
        let row: (String,) = sqlx::query_as("SELECT body FROM templates WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {slug}")))?;
        serde_json::from_str(&row.0).map_err(|e| Error::Invalid(format!("corrupt template: {e}")))
    }

    /// Applies `slug` as a new squad owned by `owner_id`. `customization`
    /// overrides per-role agent fields (specialization, generatorRef,
    /// systemPromptRef, toolCapabilities) without altering the template's
    /// routing topology. The whole operation commits or rolls back as one
    /// unit: a template naming a routing rule whose `responderRole` has no
    /// corresponding agent entry is rejected and creates nothing.
    pub async fn apply_template(
        &self,
        slug: &str,
        owner_id: Uuid,
        squad_name: &str,
        customization: Option<&TemplateCustomization>,
    ) -> Result<Squad> {
        let template = self.get_template(slug).await?;
        validate_template(&template)?;

        let mut tx = self.pool.begin().await?;

        let squad = Squad {
            id: Uuid::new_v4(),
            owner_id,
            name: squad_name.to_string(),
            description: template.description.clone(),
            created_at: Utc::now(),
            active: true,
        };
        sqlx::query(
            "INSERT INTO squads (id, owner_id, name, description, created_at, active) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(squad.id.to_string())
        .bind(squad.owner_id.to_string())
        .bind(&squad.name)
        .bind(&squad.description)
        .bind(squad.created_at.to_rfc3339())
        .bind(squad.active)
        .execute(&mut *tx)
        .await?;

        for template_agent in &template.agents {
            let overridden = customization
                .and_then(|c| c.agents.iter().find(|o| o.role == template_agent.role));

            let specialization = overridden
                .and_then(|o| o.specialization.clone())
                .unwrap_or_else(|| template_agent.specialization.clone());
            let generator_ref = overridden
                .and_then(|o| o.generator_ref.clone())
                .unwrap_or_else(|| template_agent.generator_ref.clone());
            let generator_ref_text = generator_ref.as_str().map(|s| s.to_string()).unwrap_or_else(|| generator_ref.to_string());
            let system_prompt_ref = overridden
                .and_then(|o| o.system_prompt_ref.clone())
                .unwrap_or_else(|| template_agent.system_prompt_ref.clone());
            let tool_capabilities = overridden
                .and_then(|o| o.tool_capabilities.clone())
                .unwrap_or_else(|| template_agent.tool_capabilities.clone());
            let capabilities_text = serde_json::to_string(&tool_capabilities).unwrap();

            let agent_id = Uuid::new_v4();
            let insert = sqlx::query(
                "INSERT INTO agents (id, squad_id, role, specialization, generator_ref, system_prompt, tool_capabilities, active) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(agent_id.to_string())
            .bind(squad.id.to_string())
            .bind(template_agent.role.as_str())
            .bind(&specialization)
            .bind(&generator_ref_text)
            .bind(&system_prompt_ref)
            .bind(&capabilities_text)
            .bind(true)
            .execute(&mut *tx)
            .await;

            if let Err(e) = insert {
                tx.rollback().await.ok();
                return Err(Error::Database(e));
            }
        }

        for rule in &template.routing_rules {
            let insert = sqlx::query(
                "INSERT INTO routing_rules (id, squad_id, asker_role, question_type, escalation_level, responder_role, priority, active) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(squad.id.to_string())
            .bind(rule.asker_role.as_str())
            .bind(&rule.question_type)
            .bind(rule.escalation_level)
            .bind(rule.responder_role.as_str())
            .bind(rule.priority)
            .bind(true)
            .execute(&mut *tx)
            .await;

            if let Err(e) = insert {
                tx.rollback().await.ok();
                return Err(Error::Database(e));
            }
        }

        tx.commit().await?;
        Ok(squad)
    }

    /// Soft-deletes a squad: history is kept, the squad simply stops
    /// accepting new conversations.
    pub async fn delete_squad(&self, squad_id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE squads SET active = 0 WHERE id = ?")
            .bind(squad_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("squad {squad_id}")));
        }
        Ok(())
    }
}

/// Checks the invariants required before a template is ever persisted or
/// applied: at least one `project_manager`, and every routing rule's
/// `responderRole` resolvable to a declared agent role.
fn validate_template(template: &SquadTemplate) -> Result<()> {
    if template.agents.is_empty() {
        return Err(Error::Invalid("template declares no agents".to_string()));
    }
    if !template.agents.iter().any(|a| a.role == Role::ProjectManager) {
        return Err(Error::Invalid(
            "template must declare at least one project_manager agent".to_string(),
        ));
    }

    let declared_roles: HashSet<Role> = template.agents.iter().map(|a| a.role).collect();
    for rule in &template.routing_rules {
        if !declared_roles.contains(&rule.responder_role) {
            return Err(Error::Invalid(format!(
                "routing rule responderRole {} has no corresponding agent in this template",
                rule.responder_role
            )));
        }
        if !declared_roles.contains(&rule.asker_role) {
            return Err(Error::Invalid(format!(
                "routing rule askerRole {} has no corresponding agent in this template",
                rule.asker_role
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TemplateAgent, TemplateRoutingRule};
    use crate::store::EventStore;

    fn sample_template() -> SquadTemplate {
        SquadTemplate {
            name: "Backend Squad".to_string(),
            slug: "backend-squad".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            agents: vec![
                TemplateAgent {
                    role: Role::ProjectManager,
                    specialization: "default".to_string(),
                    generator_ref: serde_json::json!("gpt-default"),
                    system_prompt_ref: "pm.md".to_string(),
                    tool_capabilities: vec![],
                },
                TemplateAgent {
                    role: Role::BackendDeveloper,
                    specialization: "default".to_string(),
                    generator_ref: serde_json::json!("gpt-default"),
                    system_prompt_ref: "dev.md".to_string(),
                    tool_capabilities: vec!["shell.exec".to_string()],
                },
            ],
            routing_rules: vec![TemplateRoutingRule {
                asker_role: Role::BackendDeveloper,
                question_type: "default".to_string(),
                escalation_level: 0,
                responder_role: Role::ProjectManager,
                priority: 1,
            }],
        }
    }

    #[tokio::test]
    async fn applies_a_valid_template_atomically() {
        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        let service = TemplateService::new(store.pool().clone());
        service.save_template(&sample_template()).await.unwrap();

        let squad = service
            .apply_template("backend-squad", Uuid::new_v4(), "My Squad", None)
            .await
            .unwrap();

        let agents: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents WHERE squad_id = ?")
            .bind(squad.id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(agents.0, 2);
    }

    #[tokio::test]
    async fn rejects_a_template_with_an_orphan_responder_role() {
        let mut template = sample_template();
        template.routing_rules[0].responder_role = Role::QaTester;

        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        let service = TemplateService::new(store.pool().clone());
        let err = service.save_template(&template).await.unwrap_err();
        assert_eq!(err.code(), "Invalid");
    }
}
