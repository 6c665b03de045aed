//! Persistencia de equipos, sobres y destinatarios en Neo4j.
//!
//! Modelo del grafo:
//! `(:User {id, api_token})-[:MEMBER_OF]->(:Team {id})`,
//! `(:Team)-[:OWNS]->(:Envelope {id})-[:HAS_ITEM]->(:EnvelopeItem {id, title, order})`,
//! `(:Envelope)-[:HAS_RECIPIENT]->(:Recipient {id, name, email, role, signing_order})`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::{debug, info};
use url::Url;

use crate::config::AppConfig;
use crate::models::{AuthorizedUser, Envelope, EnvelopeItem, RecipientDirectoryEntry, RecipientRole};

/// Resultado de autorizar un token contra un equipo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Granted(AuthorizedUser),
    /// Token desconocido.
    UnknownToken,
    /// Token válido pero el usuario no pertenece al equipo.
    NotAMember,
}

/// Colaborador de persistencia que consume la API de detección.
#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    async fn authorize(&self, api_token: &str, team_id: i64) -> Result<Authorization>;

    async fn find_envelope(&self, envelope_id: &str, team_id: i64) -> Result<Option<Envelope>>;

    async fn lookup_recipients(&self, envelope_id: &str) -> Result<Vec<RecipientDirectoryEntry>>;
}

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea las constraints de unicidad de las etiquetas del grafo.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        "CREATE CONSTRAINT team_id IF NOT EXISTS
         FOR (t:Team)
         REQUIRE t.id IS UNIQUE",
        "CREATE CONSTRAINT user_id IF NOT EXISTS
         FOR (u:User)
         REQUIRE u.id IS UNIQUE",
        "CREATE CONSTRAINT user_api_token IF NOT EXISTS
         FOR (u:User)
         REQUIRE u.api_token IS UNIQUE",
        "CREATE CONSTRAINT envelope_id IF NOT EXISTS
         FOR (e:Envelope)
         REQUIRE e.id IS UNIQUE",
        "CREATE CONSTRAINT envelope_item_id IF NOT EXISTS
         FOR (i:EnvelopeItem)
         REQUIRE i.id IS UNIQUE",
        "CREATE CONSTRAINT recipient_id IF NOT EXISTS
         FOR (r:Recipient)
         REQUIRE r.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints de sobres y destinatarios).");
    Ok(())
}

#[derive(Clone)]
pub struct Neo4jStore {
    graph: Arc<Graph>,
}

impl Neo4jStore {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl EnvelopeStore for Neo4jStore {
    async fn authorize(&self, api_token: &str, team_id: i64) -> Result<Authorization> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (u:User {api_token: $token})
                     OPTIONAL MATCH (u)-[:MEMBER_OF]->(t:Team {id: $team_id})
                     RETURN u.id AS user_id, t.id AS team_id",
                )
                .param("token", api_token.to_string())
                .param("team_id", team_id),
            )
            .await?;

        let Some(row) = cursor.next().await? else {
            return Ok(Authorization::UnknownToken);
        };
        let Some(user_id) = row.get::<i64>("user_id") else {
            return Ok(Authorization::UnknownToken);
        };
        Ok(match row.get::<i64>("team_id") {
            Some(team_id) => Authorization::Granted(AuthorizedUser { user_id, team_id }),
            None => Authorization::NotAMember,
        })
    }

    async fn find_envelope(&self, envelope_id: &str, team_id: i64) -> Result<Option<Envelope>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (t:Team {id: $team_id})-[:OWNS]->(e:Envelope {id: $envelope_id})
                     OPTIONAL MATCH (e)-[:HAS_ITEM]->(i:EnvelopeItem)
                     RETURN e.id AS envelope_id, i.id AS item_id, i.title AS title, i.order AS item_order
                     ORDER BY i.order ASC",
                )
                .param("team_id", team_id)
                .param("envelope_id", envelope_id.to_string()),
            )
            .await?;

        let mut envelope: Option<Envelope> = None;
        while let Some(row) = cursor.next().await? {
            let env = envelope.get_or_insert_with(|| Envelope {
                id: envelope_id.to_string(),
                team_id,
                items: Vec::new(),
            });
            if let Some(item_id) = row.get::<String>("item_id") {
                env.items.push(EnvelopeItem {
                    id: item_id,
                    title: row.get::<String>("title").unwrap_or_default(),
                    order: row.get::<i64>("item_order").unwrap_or(0),
                });
            }
        }

        if let Some(env) = &envelope {
            debug!(envelope_id, items = env.items.len(), "Sobre encontrado");
        }
        Ok(envelope)
    }

    async fn lookup_recipients(&self, envelope_id: &str) -> Result<Vec<RecipientDirectoryEntry>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (:Envelope {id: $envelope_id})-[:HAS_RECIPIENT]->(r:Recipient)
                     RETURN r.id AS id, r.name AS name, r.email AS email,
                            r.role AS role, r.signing_order AS signing_order",
                )
                .param("envelope_id", envelope_id.to_string()),
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = cursor.next().await? {
            let Some(id) = row.get::<i64>("id") else {
                continue;
            };
            let email = row.get::<String>("email").filter(|e| !e.trim().is_empty());
            let display_name = row
                .get::<String>("name")
                .filter(|n| !n.trim().is_empty())
                .or_else(|| email.clone())
                .unwrap_or_else(|| format!("Destinatario {id}"));
            entries.push(RecipientDirectoryEntry {
                id,
                display_name,
                email,
                role: row
                    .get::<String>("role")
                    .map(|r| RecipientRole::parse_lenient(&r))
                    .unwrap_or(RecipientRole::Signer),
                signing_order: row.get::<i64>("signing_order"),
            });
        }
        Ok(entries)
    }
}
