//! Profile graph: null-coalescing merges of user facts and MERGE-style
//! upserts of shared symptom/condition nodes and per-user family members.

use rusqlite::{params, Transaction};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::memory_db::schema::{ExtractedProfile, FamilyMemberDelta, FamilyMemberProfile, UserProfile};
use crate::memory_db::{require_user, write_tx, DbPool};

/// Null-coalescing reducer: a present incoming value wins, an absent one
/// keeps what is stored.
pub fn merge_field<T>(existing: Option<T>, incoming: Option<T>) -> Option<T> {
    incoming.or(existing)
}

/// Key for symptom, condition and relation nodes: trimmed, inner whitespace
/// collapsed, lower-cased. `None` for blank input.
pub fn normalize_name(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined.to_lowercase())
    }
}

#[derive(Debug, Clone, Copy)]
enum Facet {
    Symptom,
    Condition,
}

impl Facet {
    fn node_table(self) -> &'static str {
        match self {
            Facet::Symptom => "symptoms",
            Facet::Condition => "conditions",
        }
    }

    fn user_edge(self) -> (&'static str, &'static str) {
        match self {
            Facet::Symptom => ("user_symptoms", "symptom"),
            Facet::Condition => ("user_conditions", "condition"),
        }
    }

    fn family_edge(self) -> (&'static str, &'static str) {
        match self {
            Facet::Symptom => ("family_symptoms", "symptom"),
            Facet::Condition => ("family_conditions", "condition"),
        }
    }
}

pub struct ProfileStore {
    pool: Arc<DbPool>,
}

impl ProfileStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Merge one extracted profile delta into the user's graph. Never removes
    /// a recorded fact; the whole merge commits or nothing does.
    pub fn merge_profile(&self, user_id: &str, extracted: &ExtractedProfile) -> Result<(), StoreError> {
        write_tx(&self.pool, |tx| {
            require_user(tx, user_id)?;

            let (name, age): (Option<String>, Option<i64>) =
                tx.query_row("SELECT name, age FROM users WHERE id = ?1", [user_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
            tx.execute(
                "UPDATE users SET name = ?1, age = ?2 WHERE id = ?3",
                params![
                    merge_field(name, extracted.name.clone()),
                    merge_field(age, extracted.age.map(i64::from)),
                    user_id
                ],
            )?;

            for symptom in &extracted.symptoms {
                link_user(tx, user_id, Facet::Symptom, symptom)?;
            }
            for condition in &extracted.health_conditions {
                link_user(tx, user_id, Facet::Condition, condition)?;
            }
            for member in &extracted.family_members {
                merge_family_member(tx, user_id, member)?;
            }
            Ok(())
        })?;

        info!("Updated information for user ID {}", user_id);
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str) -> Result<UserProfile, StoreError> {
        let conn = self.pool.get()?;
        let (name, age): (Option<String>, Option<i64>) = conn
            .query_row("SELECT name, age FROM users WHERE id = ?1", [user_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::UnknownUser(user_id.to_string()),
                other => StoreError::Database(other),
            })?;

        let symptoms = names(&conn, "SELECT symptom FROM user_symptoms WHERE user_id = ?1 ORDER BY symptom", user_id)?;
        let conditions = names(
            &conn,
            "SELECT condition FROM user_conditions WHERE user_id = ?1 ORDER BY condition",
            user_id,
        )?;

        let mut stmt =
            conn.prepare("SELECT id, relation, name, age FROM family_members WHERE user_id = ?1 ORDER BY relation")?;
        let members: Vec<(i64, String, Option<String>, Option<i64>)> = stmt
            .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut family_members = Vec::with_capacity(members.len());
        for (id, relation, name, age) in members {
            family_members.push(FamilyMemberProfile {
                relation,
                name,
                age: to_age(age),
                symptoms: names(
                    &conn,
                    "SELECT symptom FROM family_symptoms WHERE family_member_id = ?1 ORDER BY symptom",
                    id,
                )?,
                conditions: names(
                    &conn,
                    "SELECT condition FROM family_conditions WHERE family_member_id = ?1 ORDER BY condition",
                    id,
                )?,
            });
        }

        Ok(UserProfile {
            user_id: user_id.to_string(),
            name,
            age: to_age(age),
            symptoms,
            conditions,
            family_members,
        })
    }
}

/// MERGE the shared node, then MERGE the user's edge to it.
fn link_user(tx: &Transaction<'_>, user_id: &str, facet: Facet, raw: &str) -> Result<(), StoreError> {
    let Some(name) = normalize_name(raw) else {
        return Ok(());
    };
    merge_node(tx, facet, &name)?;
    let (table, column) = facet.user_edge();
    tx.execute(
        &format!("INSERT OR IGNORE INTO {} (user_id, {}) VALUES (?1, ?2)", table, column),
        params![user_id, name],
    )?;
    Ok(())
}

fn link_family(tx: &Transaction<'_>, member_id: i64, facet: Facet, raw: &str) -> Result<(), StoreError> {
    let Some(name) = normalize_name(raw) else {
        return Ok(());
    };
    merge_node(tx, facet, &name)?;
    let (table, column) = facet.family_edge();
    tx.execute(
        &format!("INSERT OR IGNORE INTO {} (family_member_id, {}) VALUES (?1, ?2)", table, column),
        params![member_id, name],
    )?;
    Ok(())
}

fn merge_node(tx: &Transaction<'_>, facet: Facet, name: &str) -> Result<(), StoreError> {
    tx.execute(
        &format!("INSERT OR IGNORE INTO {} (name) VALUES (?1)", facet.node_table()),
        [name],
    )?;
    Ok(())
}

/// Family members are keyed by (user, relation): a second "sister" merges
/// into the first.
fn merge_family_member(tx: &Transaction<'_>, user_id: &str, member: &FamilyMemberDelta) -> Result<(), StoreError> {
    let Some(relation) = member.relation.as_deref().and_then(normalize_name) else {
        debug!("Skipping family member without a relation for user {}", user_id);
        return Ok(());
    };

    tx.execute(
        "INSERT OR IGNORE INTO family_members (user_id, relation) VALUES (?1, ?2)",
        params![user_id, relation],
    )?;
    let (member_id, name, age): (i64, Option<String>, Option<i64>) = tx.query_row(
        "SELECT id, name, age FROM family_members WHERE user_id = ?1 AND relation = ?2",
        params![user_id, relation],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    tx.execute(
        "UPDATE family_members SET name = ?1, age = ?2 WHERE id = ?3",
        params![
            merge_field(name, member.name.clone()),
            merge_field(age, member.age.map(i64::from)),
            member_id
        ],
    )?;

    for symptom in &member.symptoms {
        link_family(tx, member_id, Facet::Symptom, symptom)?;
    }
    for condition in &member.condition {
        link_family(tx, member_id, Facet::Condition, condition)?;
    }
    Ok(())
}

fn names<P: rusqlite::ToSql>(conn: &rusqlite::Connection, sql: &str, key: P) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([key], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

fn to_age(age: Option<i64>) -> Option<u32> {
    age.and_then(|a| u32::try_from(a).ok())
}
