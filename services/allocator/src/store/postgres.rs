//! Postgres-backed node and allocation store.
//!
//! Reservation and association writes are single conditional `UPDATE`
//! statements; when one matches no row, the current row is read back to
//! report why.

use async_trait::async_trait;
use bmfleet_id::{AllocationId, NodeId};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{AllocationFilter, AllocationStore, NodeFilter, NodeStore, StoreError, StoreResult};
use crate::model::{
    Allocation, AllocationState, Association, Node, PowerState, ProvisionState,
};

const NODE_COLUMNS: &str = "id, name, resource_class, power_state, provision_state, \
     maintenance, traits, instance_uuid, allocation_id, reservation, updated_at";

const ALLOCATION_COLUMNS: &str = "id, name, state, resource_class, traits, candidate_nodes, \
     node_id, last_error, conductor_affinity, extra, created_at, updated_at";

/// Node and allocation store over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_node(&self, id: NodeId) -> StoreResult<Option<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1");
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id.uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Node::try_from).transpose()
    }
}

#[async_trait]
impl NodeStore for PgStore {
    async fn put_node(&self, node: &Node) -> StoreResult<()> {
        let traits: Vec<String> = node.traits.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO nodes (
                id, name, resource_class, power_state, provision_state,
                maintenance, traits, instance_uuid, allocation_id, reservation, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                resource_class = excluded.resource_class,
                power_state = excluded.power_state,
                provision_state = excluded.provision_state,
                maintenance = excluded.maintenance,
                traits = excluded.traits,
                instance_uuid = excluded.instance_uuid,
                allocation_id = excluded.allocation_id,
                reservation = excluded.reservation,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(node.id.uuid())
        .bind(&node.name)
        .bind(&node.resource_class)
        .bind(node.power_state.as_str())
        .bind(node.provision_state.as_str())
        .bind(node.maintenance)
        .bind(traits)
        .bind(node.instance_uuid)
        .bind(node.allocation_id.map(|id| id.uuid()))
        .bind(&node.reservation)
        .bind(node.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, id: NodeId) -> StoreResult<Node> {
        self.fetch_node(id)
            .await?
            .ok_or(StoreError::NodeNotFound(id))
    }

    #[instrument(skip(self))]
    async fn list_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>> {
        let mut query =
            QueryBuilder::<Postgres>::new(format!("SELECT {NODE_COLUMNS} FROM nodes WHERE TRUE"));

        if let Some(resource_class) = &filter.resource_class {
            query
                .push(" AND resource_class = ")
                .push_bind(resource_class.clone());
        }
        if let Some(state) = filter.provision_state {
            query
                .push(" AND provision_state = ")
                .push_bind(state.as_str());
        }
        if let Some(maintenance) = filter.maintenance {
            query.push(" AND maintenance = ").push_bind(maintenance);
        }
        match filter.associated {
            Some(true) => {
                query.push(" AND instance_uuid IS NOT NULL");
            }
            Some(false) => {
                query.push(" AND instance_uuid IS NULL");
            }
            None => {}
        }
        if filter.require_known_power {
            query
                .push(" AND power_state <> ")
                .push_bind(PowerState::Unknown.as_str());
        }
        if !filter.traits.is_empty() {
            query.push(" AND traits @> ").push_bind(filter.traits.clone());
        }
        if let Some(ids) = &filter.ids {
            let ids: Vec<Uuid> = ids.iter().map(NodeId::uuid).collect();
            query.push(" AND id = ANY(").push_bind(ids).push(")");
        }
        query.push(" ORDER BY id");

        let rows = query
            .build_query_as::<NodeRow>()
            .fetch_all(&self.pool)
            .await?;
        debug!(count = rows.len(), "Listed nodes");
        rows.into_iter().map(Node::try_from).collect()
    }

    async fn reserve_node(&self, id: NodeId, owner: &str) -> StoreResult<Node> {
        let sql = format!(
            "UPDATE nodes SET reservation = $2, updated_at = now() \
             WHERE id = $1 AND reservation IS NULL RETURNING {NODE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id.uuid())
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return Node::try_from(row);
        }

        match self.fetch_node(id).await? {
            None => Err(StoreError::NodeNotFound(id)),
            Some(node) => Err(StoreError::NodeLocked {
                node_id: id,
                // Released between the update and the read; still a lost race.
                holder: node.reservation.unwrap_or_else(|| "unknown".to_string()),
            }),
        }
    }

    async fn release_node(&self, id: NodeId) -> StoreResult<()> {
        sqlx::query(
            "UPDATE nodes SET reservation = NULL, updated_at = now() \
             WHERE id = $1 AND reservation IS NOT NULL",
        )
        .bind(id.uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_reservations(&self, owner_prefix: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE nodes SET reservation = NULL, updated_at = now() \
             WHERE left(reservation, length($1)) = $1",
        )
        .bind(owner_prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_association(
        &self,
        id: NodeId,
        owner: &str,
        association: Option<Association>,
    ) -> StoreResult<Node> {
        let row = match association {
            Some(association) => {
                let sql = format!(
                    "UPDATE nodes SET instance_uuid = $3, allocation_id = $4, updated_at = now() \
                     WHERE id = $1 AND reservation = $2 AND instance_uuid IS NULL \
                     RETURNING {NODE_COLUMNS}"
                );
                sqlx::query_as::<_, NodeRow>(&sql)
                    .bind(id.uuid())
                    .bind(owner)
                    .bind(association.instance_uuid)
                    .bind(association.allocation_id.uuid())
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "UPDATE nodes SET instance_uuid = NULL, allocation_id = NULL, updated_at = now() \
                     WHERE id = $1 AND reservation = $2 \
                     RETURNING {NODE_COLUMNS}"
                );
                sqlx::query_as::<_, NodeRow>(&sql)
                    .bind(id.uuid())
                    .bind(owner)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        if let Some(row) = row {
            return Node::try_from(row);
        }

        let node = self
            .fetch_node(id)
            .await?
            .ok_or(StoreError::NodeNotFound(id))?;
        if node.reservation.as_deref() != Some(owner) {
            return Err(StoreError::NotLocked {
                node_id: id,
                owner: owner.to_string(),
            });
        }
        match node.instance_uuid {
            Some(instance_uuid) => Err(StoreError::NodeAssociated {
                node_id: id,
                instance_uuid,
            }),
            None => Err(StoreError::NotLocked {
                node_id: id,
                owner: owner.to_string(),
            }),
        }
    }
}

fn allocation_write_error(err: sqlx::Error, allocation: &Allocation) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return match (&allocation.name, db_err.constraint()) {
                (Some(name), Some("allocations_name_key")) => {
                    StoreError::AllocationDuplicateName(name.clone())
                }
                _ => StoreError::AllocationAlreadyExists(allocation.id),
            };
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl AllocationStore for PgStore {
    async fn create_allocation(&self, allocation: &Allocation) -> StoreResult<()> {
        let candidates: Vec<Uuid> = allocation.candidate_nodes.iter().map(NodeId::uuid).collect();
        sqlx::query(
            r#"
            INSERT INTO allocations (
                id, name, state, resource_class, traits, candidate_nodes,
                node_id, last_error, conductor_affinity, extra, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(allocation.id.uuid())
        .bind(&allocation.name)
        .bind(allocation.state.as_str())
        .bind(&allocation.resource_class)
        .bind(&allocation.traits)
        .bind(candidates)
        .bind(allocation.node_id.map(|id| id.uuid()))
        .bind(&allocation.last_error)
        .bind(&allocation.conductor_affinity)
        .bind(serde_json::Value::Object(allocation.extra.clone()))
        .bind(allocation.created_at)
        .bind(allocation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| allocation_write_error(e, allocation))?;
        Ok(())
    }

    async fn get_allocation(&self, id: AllocationId) -> StoreResult<Allocation> {
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE id = $1");
        let row = sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(id.uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::AllocationNotFound(id.to_string()))?;
        Allocation::try_from(row)
    }

    async fn get_allocation_by_name(&self, name: &str) -> StoreResult<Allocation> {
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE name = $1");
        let row = sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::AllocationNotFound(name.to_string()))?;
        Allocation::try_from(row)
    }

    async fn update_allocation(&self, allocation: &Allocation) -> StoreResult<()> {
        let candidates: Vec<Uuid> = allocation.candidate_nodes.iter().map(NodeId::uuid).collect();
        let result = sqlx::query(
            r#"
            UPDATE allocations SET
                name = $2,
                state = $3,
                resource_class = $4,
                traits = $5,
                candidate_nodes = $6,
                node_id = $7,
                last_error = $8,
                conductor_affinity = $9,
                extra = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(allocation.id.uuid())
        .bind(&allocation.name)
        .bind(allocation.state.as_str())
        .bind(&allocation.resource_class)
        .bind(&allocation.traits)
        .bind(candidates)
        .bind(allocation.node_id.map(|id| id.uuid()))
        .bind(&allocation.last_error)
        .bind(&allocation.conductor_affinity)
        .bind(serde_json::Value::Object(allocation.extra.clone()))
        .bind(allocation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| allocation_write_error(e, allocation))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AllocationNotFound(allocation.id.to_string()));
        }
        Ok(())
    }

    async fn delete_allocation(&self, id: AllocationId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM allocations WHERE id = $1")
            .bind(id.uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AllocationNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_allocations(&self, filter: &AllocationFilter) -> StoreResult<Vec<Allocation>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE TRUE"
        ));
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(conductor) = &filter.conductor_affinity {
            query
                .push(" AND conductor_affinity = ")
                .push_bind(conductor.clone());
        }
        query.push(" ORDER BY created_at, id");

        let rows = query
            .build_query_as::<AllocationRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Allocation::try_from).collect()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug)]
struct NodeRow {
    id: Uuid,
    name: Option<String>,
    resource_class: Option<String>,
    power_state: String,
    provision_state: String,
    maintenance: bool,
    traits: Vec<String>,
    instance_uuid: Option<Uuid>,
    allocation_id: Option<Uuid>,
    reservation: Option<String>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            resource_class: row.try_get("resource_class")?,
            power_state: row.try_get("power_state")?,
            provision_state: row.try_get("provision_state")?,
            maintenance: row.try_get("maintenance")?,
            traits: row.try_get("traits")?,
            instance_uuid: row.try_get("instance_uuid")?,
            allocation_id: row.try_get("allocation_id")?,
            reservation: row.try_get("reservation")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| StoreError::Corrupt {
            table: "nodes",
            id: row.id.to_string(),
            message,
        };
        let power_state = PowerState::from_str(&row.power_state)
            .ok_or_else(|| corrupt(format!("unknown power state '{}'", row.power_state)))?;
        let provision_state = ProvisionState::from_str(&row.provision_state).ok_or_else(|| {
            corrupt(format!("unknown provision state '{}'", row.provision_state))
        })?;

        Ok(Node {
            id: NodeId::from_uuid(row.id),
            name: row.name,
            resource_class: row.resource_class,
            power_state,
            provision_state,
            maintenance: row.maintenance,
            traits: row.traits.into_iter().collect(),
            instance_uuid: row.instance_uuid,
            allocation_id: row.allocation_id.map(AllocationId::from_uuid),
            reservation: row.reservation,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct AllocationRow {
    id: Uuid,
    name: Option<String>,
    state: String,
    resource_class: String,
    traits: Vec<String>,
    candidate_nodes: Vec<Uuid>,
    node_id: Option<Uuid>,
    last_error: Option<String>,
    conductor_affinity: Option<String>,
    extra: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AllocationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            state: row.try_get("state")?,
            resource_class: row.try_get("resource_class")?,
            traits: row.try_get("traits")?,
            candidate_nodes: row.try_get("candidate_nodes")?,
            node_id: row.try_get("node_id")?,
            last_error: row.try_get("last_error")?,
            conductor_affinity: row.try_get("conductor_affinity")?,
            extra: row.try_get("extra")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<AllocationRow> for Allocation {
    type Error = StoreError;

    fn try_from(row: AllocationRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| StoreError::Corrupt {
            table: "allocations",
            id: row.id.to_string(),
            message,
        };
        let state = AllocationState::from_str(&row.state)
            .ok_or_else(|| corrupt(format!("unknown state '{}'", row.state)))?;
        let extra = match row.extra {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => return Err(corrupt(format!("extra is not an object: {other}"))),
        };

        Ok(Allocation {
            id: AllocationId::from_uuid(row.id),
            name: row.name,
            state,
            resource_class: row.resource_class,
            traits: row.traits,
            candidate_nodes: row
                .candidate_nodes
                .into_iter()
                .map(NodeId::from_uuid)
                .collect(),
            node_id: row.node_id.map(NodeId::from_uuid),
            last_error: row.last_error,
            conductor_affinity: row.conductor_affinity,
            extra,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
