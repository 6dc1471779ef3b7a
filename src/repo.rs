//! Relational CRUD for the squad/agent/routing-rule/conversation tables,
//! sharing the same SQLite pool as [`crate::store::EventStore`]. Kept
//! separate from `store` because `store`
//! is specifically C1, the append-only event/message log; this is the
//! ordinary mutable-row plumbing C4 needs underneath it. Template
//! persistence lives in [`crate::template`] instead, since applying a
//! template needs transactional control this module doesn't expose.

use crate::error::{Error, Result};
use crate::model::{Agent, Conversation, ConversationState, Role, RoutingRule, Squad};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Clone)]
pub struct Repo {
    pool: SqlitePool,
}

impl Repo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_squad(&self, owner_id: Uuid, name: &str, description: Option<&str>) -> Result<Squad> {
        let squad = Squad {
            id: Uuid::new_v4(),
            owner_id,
            name: name.to_string(),
            description: description.map(|s| s.to_string()),
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
        .execute(&self.pool)
        .await?;
        Ok(squad)
    }

    pub async fn get_squad(&self, id: Uuid) -> Result<Squad> {
        let row = sqlx::query("SELECT id, owner_id, name, description, created_at, active FROM squads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("squad {id}")))?;
        row_to_squad(&row)
    }

    /// Every squad with `active = true`, used at startup to resume agent
    /// runtimes for squads that existed before the process restarted.
    pub async fn list_active_squads(&self) -> Result<Vec<Squad>> {
        let rows = sqlx::query(
            "SELECT id, owner_id, name, description, created_at, active FROM squads WHERE active = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_squad).collect()
    }

    pub async fn deactivate_squad(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE squads SET active = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("squad {id}")));
        }
        Ok(())
    }

    pub async fn create_agent(
        &self,
        squad_id: Uuid,
        role: Role,
        specialization: &str,
        generator_ref: &str,
        system_prompt: &str,
        tool_capabilities: Vec<String>,
    ) -> Result<Agent> {
        let agent = Agent {
            id: Uuid::new_v4(),
            squad_id,
            role,
            specialization: specialization.to_string(),
            generator_ref: generator_ref.to_string(),
            system_prompt: system_prompt.to_string(),
            tool_capabilities,
            active: true,
        };
        let capabilities_text = serde_json::to_string(&agent.tool_capabilities).unwrap();
        sqlx::query(
            "INSERT INTO agents (id, squad_id, role, specialization, generator_ref, system_prompt, tool_capabilities, active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent.id.to_string())
        .bind(agent.squad_id.to_string())
        .bind(agent.role.as_str())
        .bind(&agent.specialization)
        .bind(&agent.generator_ref)
        .bind(&agent.system_prompt)
        .bind(&capabilities_text)
        .bind(agent.active)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Error::Conflict(
                format!("agent with role {} and specialization {} already exists in squad", agent.role, agent.specialization),
            ),
            _ => Error::Database(e),
        })?;
        Ok(agent)
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Agent> {
        let row = sqlx::query(
            "SELECT id, squad_id, role, specialization, generator_ref, system_prompt, tool_capabilities, active \
             FROM agents WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("agent {id}")))?;
        row_to_agent(&row)
    }

    pub async fn list_agents(&self, squad_id: Uuid) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT id, squad_id, role, specialization, generator_ref, system_prompt, tool_capabilities, active \
             FROM agents WHERE squad_id = ?",
        )
        .bind(squad_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_agent).collect()
    }

    pub async fn create_rule(
        &self,
        squad_id: Uuid,
        asker_role: Role,
        question_type: &str,
        escalation_level: i64,
        responder_role: Role,
        priority: i64,
    ) -> Result<RoutingRule> {
        let rule = RoutingRule {
            id: Uuid::new_v4(),
            squad_id,
            asker_role,
            question_type: question_type.to_string(),
            escalation_level,
            responder_role,
            priority,
            active: true,
        };
        sqlx::query(
            "INSERT INTO routing_rules (id, squad_id, asker_role, question_type, escalation_level, responder_role, priority, active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(rule.id.to_string())
        .bind(rule.squad_id.to_string())
        .bind(rule.asker_role.as_str())
        .bind(&rule.question_type)
        .bind(rule.escalation_level)
        .bind(rule.responder_role.as_str())
        .bind(rule.priority)
        .bind(rule.active)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Error::Conflict("duplicate routing rule".to_string())
            }
            _ => Error::Database(e),
        })?;
        Ok(rule)
    }

    pub async fn list_rules(&self, squad_id: Uuid) -> Result<Vec<RoutingRule>> {
        let rows = sqlx::query(
            "SELECT id, squad_id, asker_role, question_type, escalation_level, responder_role, priority, active \
             FROM routing_rules WHERE squad_id = ?",
        )
        .bind(squad_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_rule).collect()
    }

    pub async fn create_conversation(
        &self,
        squad_id: Uuid,
        task_execution_id: Option<Uuid>,
        asker_agent_id: Uuid,
        current_responder_agent_id: Option<Uuid>,
        question_type: &str,
        escalation_level: i64,
        parent_conversation_id: Option<Uuid>,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            squad_id,
            task_execution_id,
            asker_agent_id,
            current_responder_agent_id,
            question_type: question_type.to_string(),
            escalation_level,
            state: ConversationState::Initiated,
            parent_conversation_id,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };
        sqlx::query(
            "INSERT INTO conversations \
             (id, squad_id, task_execution_id, asker_agent_id, current_responder_agent_id, question_type, \
              escalation_level, state, parent_conversation_id, created_at, updated_at, closed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation.id.to_string())
        .bind(conversation.squad_id.to_string())
        .bind(conversation.task_execution_id.map(|t| t.to_string()))
        .bind(conversation.asker_agent_id.to_string())
        .bind(conversation.current_responder_agent_id.map(|r| r.to_string()))
        .bind(&conversation.question_type)
        .bind(conversation.escalation_level)
        .bind(conversation.state.as_str())
        .bind(conversation.parent_conversation_id.map(|p| p.to_string()))
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .bind(conversation.closed_at.map(|c| c.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        let row = sqlx::query(
            "SELECT id, squad_id, task_execution_id, asker_agent_id, current_responder_agent_id, \
             question_type, escalation_level, state, parent_conversation_id, created_at, updated_at, closed_at \
             FROM conversations WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
        row_to_conversation(&row)
    }

    /// Resolves the squad a `taskExecutionId` belongs to by finding any
    /// conversation tagged with it — used by the `/sse/execution/{id}`
    /// route, which scopes by execution alone.
    pub async fn find_squad_for_execution(&self, task_execution_id: Uuid) -> Result<Uuid> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT squad_id FROM conversations WHERE task_execution_id = ? LIMIT 1",
        )
        .bind(task_execution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let (squad_id,) = row.ok_or_else(|| Error::NotFound(format!("execution {task_execution_id}")))?;
        Uuid::parse_str(&squad_id).map_err(|e| Error::Invalid(e.to_string()))
    }

    /// All conversations still in `waiting`, used by the crash-recovery
    /// sweep to find overdue timers.
    pub async fn list_waiting_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, squad_id, task_execution_id, asker_agent_id, current_responder_agent_id, \
             question_type, escalation_level, state, parent_conversation_id, created_at, updated_at, closed_at \
             FROM conversations WHERE state = 'waiting'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_conversation).collect()
    }

    pub async fn update_conversation_state(
        &self,
        id: Uuid,
        state: ConversationState,
        current_responder_agent_id: Option<Uuid>,
        escalation_level: Option<i64>,
        closed: bool,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE conversations SET state = ?, \
             current_responder_agent_id = COALESCE(?, current_responder_agent_id), \
             escalation_level = COALESCE(?, escalation_level), \
             updated_at = ?, closed_at = CASE WHEN ? THEN ? ELSE closed_at END \
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(current_responder_agent_id.map(|a| a.to_string()))
        .bind(escalation_level)
        .bind(now.to_rfc3339())
        .bind(closed)
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

}

fn row_to_squad(row: &SqliteRow) -> Result<Squad> {
    let id: String = row.try_get("id")?;
    let owner_id: String = row.try_get("owner_id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Squad {
        id: Uuid::parse_str(&id).map_err(|e| Error::Invalid(e.to_string()))?,
        owner_id: Uuid::parse_str(&owner_id).map_err(|e| Error::Invalid(e.to_string()))?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Invalid(e.to_string()))?
            .with_timezone(&Utc),
        active: row.try_get("active")?,
    })
}

fn row_to_agent(row: &SqliteRow) -> Result<Agent> {
    let id: String = row.try_get("id")?;
    let squad_id: String = row.try_get("squad_id")?;
    let role: String = row.try_get("role")?;
    let tool_capabilities: String = row.try_get("tool_capabilities")?;
    Ok(Agent {
        id: Uuid::parse_str(&id).map_err(|e| Error::Invalid(e.to_string()))?,
        squad_id: Uuid::parse_str(&squad_id).map_err(|e| Error::Invalid(e.to_string()))?,
        role: Role::parse(&role).ok_or_else(|| Error::Invalid(format!("unknown role {role}")))?,
        specialization: row.try_get("specialization")?,
        generator_ref: row.try_get("generator_ref")?,
        system_prompt: row.try_get("system_prompt")?,
        tool_capabilities: serde_json::from_str(&tool_capabilities)
            .map_err(|e| Error::Invalid(format!("corrupt tool_capabilities: {e}")))?,
        active: row.try_get("active")?,
    })
}

fn row_to_rule(row: &SqliteRow) -> Result<RoutingRule> {
    let id: String = row.try_get("id")?;
    let squad_id: String = row.try_get("squad_id")?;
    let asker_role: String = row.try_get("asker_role")?;
    let responder_role: String = row.try_get("responder_role")?;
    Ok(RoutingRule {
        id: Uuid::parse_str(&id).map_err(|e| Error::Invalid(e.to_string()))?,
        squad_id: Uuid::parse_str(&squad_id).map_err(|e| Error::Invalid(e.to_string()))?,
        asker_role: Role::parse(&asker_role)
            .ok_or_else(|| Error::Invalid(format!("unknown role {asker_role}")))?,
        question_type: row.try_get("question_type")?,
        escalation_level: row.try_get("escalation_level")?,
        responder_role: Role::parse(&responder_role)
            .ok_or_else(|| Error::Invalid(format!("unknown role {responder_role}")))?,
        priority: row.try_get("priority")?,
        active: row.try_get("active")?,
    })
}

fn row_to_conversation(row: &SqliteRow) -> Result<Conversation> {
    let id: String = row.try_get("id")?;
    let squad_id: String = row.try_get("squad_id")?;
    let task_execution_id: Option<String> = row.try_get("task_execution_id")?;
    let asker_agent_id: String = row.try_get("asker_agent_id")?;
    let current_responder_agent_id: Option<String> = row.try_get("current_responder_agent_id")?;
    let state: String = row.try_get("state")?;
    let parent_conversation_id: Option<String> = row.try_get("parent_conversation_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let closed_at: Option<String> = row.try_get("closed_at")?;

    Ok(Conversation {
        id: Uuid::parse_str(&id).map_err(|e| Error::Invalid(e.to_string()))?,
        squad_id: Uuid::parse_str(&squad_id).map_err(|e| Error::Invalid(e.to_string()))?,
        task_execution_id: task_execution_id
            .map(|t| Uuid::parse_str(&t))
            .transpose()
            .map_err(|e| Error::Invalid(e.to_string()))?,
        asker_agent_id: Uuid::parse_str(&asker_agent_id).map_err(|e| Error::Invalid(e.to_string()))?,
        current_responder_agent_id: current_responder_agent_id
            .map(|r| Uuid::parse_str(&r))
            .transpose()
            .map_err(|e| Error::Invalid(e.to_string()))?,
        question_type: row.try_get("question_type")?,
        escalation_level: row.try_get("escalation_level")?,
        state: ConversationState::parse(&state)
            .ok_or_else(|| Error::Invalid(format!("unknown state {state}")))?,
        parent_conversation_id: parent_conversation_id
            .map(|p| Uuid::parse_str(&p))
            .transpose()
            .map_err(|e| Error::Invalid(e.to_string()))?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Invalid(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| Error::Invalid(e.to_string()))?
            .with_timezone(&Utc),
        closed_at: closed_at
            .map(|c| chrono::DateTime::parse_from_rfc3339(&c))
            .transpose()
            .map_err(|e| Error::Invalid(e.to_string()))?
            .map(|dt| dt.with_timezone(&Utc)),
    })
}
