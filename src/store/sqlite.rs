//! SQLite-backed cluster store.
//!
//! Clusters and memberships live in two tables. Every mutation runs in one
//! transaction, so a failure rolls back to the prior state. Cluster rows are
//! LRU cached; the cache is only touched after a successful commit.
//!
//! The route catalog can be stored alongside, with polylines and headings
//! encoded as MessagePack blobs.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::error::{ClusterError, Result};
use crate::geo_utils::bounds_around;
use crate::routes::{Route, RouteCatalog};
use crate::store::{centroid_of, rank_nearby, ClusterStore, ExpiryReport, StoreStats};
use crate::types::{Cluster, Departure, Membership, Nearby, Placement};
use crate::{now_millis, ClusterId, GpsPoint, RouteId};

const CLUSTER_CACHE_SIZE: usize = 512;

const CLUSTER_COLUMNS: &str = "id, route_id, lat, lng, member_count, plate, plate_conflicts, \
                               active, created_at, updated_at";

/// A stored route row: id, name, half width, points blob, headings blob.
type RouteRow = (RouteId, Option<String>, Option<f64>, Vec<u8>, Vec<u8>);

const MEMBERSHIP_COLUMNS: &str = "user_id, cluster_id, route_id, lat, lng, heading, speed, \
                                  accuracy, registered, confirmed, timestamp";

struct Inner {
    conn: Connection,
    cache: LruCache<ClusterId, Cluster>,
}

/// Cluster store persisted in SQLite.
pub struct SqliteClusterStore {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SqliteClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteClusterStore").finish_non_exhaustive()
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn cluster_from_row(row: &Row<'_>) -> rusqlite::Result<Cluster> {
    Ok(Cluster {
        id: row.get::<_, i64>(0)? as ClusterId,
        route_id: row.get(1)?,
        centroid: GpsPoint::new(row.get(2)?, row.get(3)?),
        member_count: row.get(4)?,
        plate: row.get(5)?,
        plate_conflicts: row.get(6)?,
        active: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        user_id: row.get(0)?,
        cluster_id: row.get::<_, i64>(1)? as ClusterId,
        route_id: row.get(2)?,
        position: GpsPoint::new(row.get(3)?, row.get(4)?),
        heading: row.get(5)?,
        speed: row.get(6)?,
        accuracy: row.get(7)?,
        registered: row.get(8)?,
        confirmed: row.get(9)?,
        timestamp: row.get(10)?,
    })
}

fn load_cluster(conn: &Connection, id: ClusterId) -> Result<Option<Cluster>> {
    let sql = format!("SELECT {} FROM clusters WHERE id = ?1", CLUSTER_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id as i64], cluster_from_row)
        .optional()?)
}

fn load_active_cluster(conn: &Connection, id: ClusterId) -> Result<Cluster> {
    match load_cluster(conn, id)? {
        Some(c) if c.active => Ok(c),
        Some(_) => Err(ClusterError::Internal {
            message: format!("cluster {} is not active", id),
        }),
        None => Err(ClusterError::Internal {
            message: format!("cluster {} does not exist", id),
        }),
    }
}

fn load_membership(conn: &Connection, user_id: &str) -> Result<Option<Membership>> {
    let sql = format!("SELECT {} FROM memberships WHERE user_id = ?1", MEMBERSHIP_COLUMNS);
    Ok(conn
        .query_row(&sql, params![user_id], membership_from_row)
        .optional()?)
}

fn load_members(conn: &Connection, cluster_id: ClusterId) -> Result<Vec<Membership>> {
    let sql = format!(
        "SELECT {} FROM memberships WHERE cluster_id = ?1 ORDER BY user_id",
        MEMBERSHIP_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![cluster_id as i64], membership_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn upsert_membership(conn: &Connection, m: &Membership) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO memberships
            (user_id, cluster_id, route_id, lat, lng, heading, speed, accuracy,
             registered, confirmed, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            m.user_id,
            m.cluster_id as i64,
            m.route_id,
            m.position.latitude,
            m.position.longitude,
            m.heading,
            m.speed,
            m.accuracy,
            m.registered,
            m.confirmed,
            m.timestamp,
        ],
    )?;
    Ok(())
}

/// Recompute count and centroid from the member rows; deactivate when empty.
fn refresh(conn: &Connection, id: ClusterId, now: i64) -> Result<(Cluster, bool)> {
    let Some(mut cluster) = load_cluster(conn, id)? else {
        return Err(ClusterError::Internal {
            message: format!("cluster {} does not exist", id),
        });
    };
    let members = load_members(conn, id)?;
    let was_active = cluster.active;

    cluster.member_count = members.len() as u32;
    cluster.centroid = centroid_of(&members, cluster.centroid);
    cluster.updated_at = now;
    if members.is_empty() {
        cluster.active = false;
    }

    conn.execute(
        "UPDATE clusters SET lat = ?2, lng = ?3, member_count = ?4, active = ?5, updated_at = ?6
         WHERE id = ?1",
        params![
            id as i64,
            cluster.centroid.latitude,
            cluster.centroid.longitude,
            cluster.member_count,
            cluster.active,
            now,
        ],
    )?;
    Ok((cluster.clone(), was_active && !cluster.active))
}

fn detach(
    conn: &Connection,
    user_id: &str,
    now: i64,
    touched: &mut Vec<ClusterId>,
) -> Result<Option<Departure>> {
    let Some(membership) = load_membership(conn, user_id)? else {
        return Ok(None);
    };
    conn.execute("DELETE FROM memberships WHERE user_id = ?1", params![user_id])?;
    let (cluster, deactivated) = refresh(conn, membership.cluster_id, now)?;
    touched.push(cluster.id);
    Ok(Some(Departure {
        user_id: membership.user_id,
        cluster,
        deactivated,
    }))
}

// ============================================================================
// Store
// ============================================================================

impl SqliteClusterStore {
    /// Open (or create) a store at the given path.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        log::info!("[SqliteStore] Opened {}", db_path);
        let capacity = NonZeroUsize::new(CLUSTER_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                cache: LruCache::new(capacity),
            }),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Clusters (one row per vehicle hypothesis, inactive rows kept)
            CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                route_id INTEGER NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                member_count INTEGER NOT NULL,
                plate TEXT,
                plate_conflicts INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- At most one membership per user
            CREATE TABLE IF NOT EXISTS memberships (
                user_id TEXT PRIMARY KEY,
                cluster_id INTEGER NOT NULL,
                route_id INTEGER NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                heading REAL,
                speed REAL,
                accuracy REAL,
                registered INTEGER NOT NULL,
                confirmed INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                FOREIGN KEY (cluster_id) REFERENCES clusters(id)
            );

            -- Route catalog (polylines as MessagePack blobs)
            CREATE TABLE IF NOT EXISTS routes (
                id INTEGER PRIMARY KEY,
                name TEXT,
                half_width REAL,
                points BLOB NOT NULL,
                headings BLOB NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_clusters_route_active ON clusters(route_id, active);
            CREATE INDEX IF NOT EXISTS idx_clusters_position ON clusters(lat, lng);
            CREATE INDEX IF NOT EXISTS idx_memberships_cluster ON memberships(cluster_id);
            CREATE INDEX IF NOT EXISTS idx_memberships_timestamp ON memberships(timestamp);

            PRAGMA foreign_keys = ON;
        "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| {
            log::error!("[SqliteStore] Connection lock poisoned");
            ClusterError::store("sqlite connection lock poisoned")
        })
    }

    /// Run `f` in one transaction. Cache entries for touched clusters are
    /// dropped only after a successful commit.
    fn transact<T, F>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>, &mut Vec<ClusterId>) -> Result<T>,
    {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let mut touched = Vec::new();

        let result = inner.conn.transaction().map_err(ClusterError::from).and_then(|tx| {
            let value = f(&tx, &mut touched)?;
            tx.commit()?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                for id in touched {
                    inner.cache.pop(&id);
                }
                Ok(value)
            }
            Err(e) => {
                if matches!(e, ClusterError::StoreUnavailable { .. }) {
                    log::error!("[SqliteStore] {} failed: {}", op, e);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Route catalog
    // ========================================================================

    /// Replace the stored route catalog.
    pub fn save_routes(&self, catalog: &RouteCatalog) -> Result<()> {
        let encoded: Vec<RouteRow> = catalog
            .iter()
            .map(|route| -> Result<RouteRow> {
                let points = rmp_serde::to_vec(route.points()).map_err(|e| ClusterError::Internal {
                    message: format!("encoding route {}: {}", route.id(), e),
                })?;
                let headings =
                    rmp_serde::to_vec(route.headings()).map_err(|e| ClusterError::Internal {
                        message: format!("encoding route {}: {}", route.id(), e),
                    })?;
                Ok((
                    route.id(),
                    route.name().map(str::to_string),
                    route.corridor_half_width(),
                    points,
                    headings,
                ))
            })
            .collect::<Result<_>>()?;

        self.transact("save_routes", |tx, _| {
            tx.execute("DELETE FROM routes", [])?;
            let mut stmt = tx.prepare(
                "INSERT INTO routes (id, name, half_width, points, headings)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (id, name, half_width, points, headings) in &encoded {
                stmt.execute(params![id, name, half_width, points, headings])?;
            }
            Ok(())
        })?;
        log::info!("[SqliteStore] Saved {} routes", encoded.len());
        Ok(())
    }

    /// Load the stored route catalog.
    pub fn load_routes(&self) -> Result<RouteCatalog> {
        let raw: Vec<RouteRow> = {
            let inner = self.lock()?;
            let mut stmt = inner
                .conn
                .prepare("SELECT id, name, half_width, points, headings FROM routes ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let routes = raw
            .into_iter()
            .map(|(id, name, half_width, points_blob, headings_blob)| -> Result<Route> {
                let decode_err = |e: rmp_serde::decode::Error| ClusterError::InvalidRoute {
                    route_id: id,
                    message: format!("stored geometry is unreadable: {}", e),
                };
                let points: Vec<GpsPoint> = rmp_serde::from_slice(&points_blob).map_err(decode_err)?;
                let headings: Vec<f64> =
                    rmp_serde::from_slice(&headings_blob).map_err(decode_err)?;

                let mut route = Route::new(id, points)?.with_headings(headings)?;
                if let Some(name) = name {
                    route = route.with_name(name);
                }
                if let Some(width) = half_width {
                    route = route.with_corridor_half_width(width)?;
                }
                Ok(route)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RouteCatalog::new(routes))
    }
}

impl ClusterStore for SqliteClusterStore {
    fn cluster(&self, id: ClusterId) -> Result<Option<Cluster>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        if let Some(cached) = inner.cache.get(&id) {
            return Ok(Some(cached.clone()));
        }
        let loaded = load_cluster(&inner.conn, id)?;
        if let Some(cluster) = &loaded {
            inner.cache.put(id, cluster.clone());
        }
        Ok(loaded)
    }

    fn active_near(
        &self,
        route_id: RouteId,
        point: &GpsPoint,
        radius_meters: f64,
    ) -> Result<Vec<Nearby>> {
        let bounds = bounds_around(point, radius_meters);
        let inner = self.lock()?;
        let sql = format!(
            "SELECT {} FROM clusters
             WHERE route_id = ?1 AND active = 1
               AND lat BETWEEN ?2 AND ?3 AND lng BETWEEN ?4 AND ?5",
            CLUSTER_COLUMNS
        );
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                route_id,
                bounds.min_lat,
                bounds.max_lat,
                bounds.min_lng,
                bounds.max_lng
            ],
            cluster_from_row,
        )?;
        let clusters = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rank_nearby(clusters, point, radius_meters))
    }

    fn active_on_route(&self, route_id: RouteId) -> Result<Vec<Cluster>> {
        let inner = self.lock()?;
        let sql = format!(
            "SELECT {} FROM clusters WHERE route_id = ?1 AND active = 1 ORDER BY id",
            CLUSTER_COLUMNS
        );
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![route_id], cluster_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn membership(&self, user_id: &str) -> Result<Option<Membership>> {
        let inner = self.lock()?;
        load_membership(&inner.conn, user_id)
    }

    fn members(&self, cluster_id: ClusterId) -> Result<Vec<Membership>> {
        let inner = self.lock()?;
        load_members(&inner.conn, cluster_id)
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock()?;
        let (clusters, active_clusters, plate_conflicts): (i64, i64, i64) = inner.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(active), 0), COALESCE(SUM(plate_conflicts), 0)
             FROM clusters",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let memberships: i64 =
            inner
                .conn
                .query_row("SELECT COUNT(*) FROM memberships", [], |row| row.get(0))?;
        Ok(StoreStats {
            clusters: clusters as usize,
            active_clusters: active_clusters as usize,
            memberships: memberships as usize,
            plate_conflicts: plate_conflicts as u64,
        })
    }

    fn create_with_member(
        &self,
        mut membership: Membership,
        plate: Option<String>,
    ) -> Result<Placement> {
        self.transact("create_with_member", |tx, touched| {
            let now = now_millis();
            let previous = detach(tx, &membership.user_id, now, touched)?;

            tx.execute(
                "INSERT INTO clusters
                    (route_id, lat, lng, member_count, plate, plate_conflicts, active,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, 0, 1, ?5, ?5)",
                params![
                    membership.route_id,
                    membership.position.latitude,
                    membership.position.longitude,
                    plate,
                    now,
                ],
            )?;
            let id = tx.last_insert_rowid() as ClusterId;
            membership.cluster_id = id;
            upsert_membership(tx, &membership)?;

            let cluster = load_active_cluster(tx, id)?;
            Ok(Placement { cluster, previous })
        })
    }

    fn place_member(
        &self,
        membership: Membership,
        claim_plate: Option<String>,
    ) -> Result<Placement> {
        self.transact("place_member", |tx, touched| {
            let now = now_millis();
            let target_id = membership.cluster_id;
            let target = load_active_cluster(tx, target_id)?;
            if target.route_id != membership.route_id {
                return Err(ClusterError::Internal {
                    message: format!(
                        "cluster {} belongs to route {}, not {}",
                        target_id, target.route_id, membership.route_id
                    ),
                });
            }
            target.plate_check(claim_plate.as_deref(), false)?;

            let previous = match load_membership(tx, &membership.user_id)? {
                Some(existing) if existing.cluster_id != target_id => {
                    detach(tx, &membership.user_id, now, touched)?
                }
                _ => None,
            };

            upsert_membership(tx, &membership)?;
            if target.plate.is_none() {
                if let Some(plate) = &claim_plate {
                    tx.execute(
                        "UPDATE clusters SET plate = ?2 WHERE id = ?1 AND plate IS NULL",
                        params![target_id as i64, plate],
                    )?;
                }
            }
            let (cluster, _) = refresh(tx, target_id, now)?;
            touched.push(target_id);
            Ok(Placement { cluster, previous })
        })
    }

    fn remove_member(&self, user_id: &str) -> Result<Option<Departure>> {
        self.transact("remove_member", |tx, touched| {
            detach(tx, user_id, now_millis(), touched)
        })
    }

    fn record_plate_conflict(&self, cluster_id: ClusterId) -> Result<()> {
        self.transact("record_plate_conflict", |tx, touched| {
            tx.execute(
                "UPDATE clusters SET plate_conflicts = plate_conflicts + 1 WHERE id = ?1",
                params![cluster_id as i64],
            )?;
            touched.push(cluster_id);
            Ok(())
        })
    }

    fn merge(&self, survivor: ClusterId, absorbed: ClusterId) -> Result<Cluster> {
        self.transact("merge", |tx, touched| {
            let now = now_millis();
            if survivor == absorbed {
                return Err(ClusterError::Internal {
                    message: format!("cannot merge cluster {} into itself", survivor),
                });
            }
            let keep = load_active_cluster(tx, survivor)?;
            let gone = load_active_cluster(tx, absorbed)?;
            if keep.route_id != gone.route_id {
                return Err(ClusterError::Internal {
                    message: format!(
                        "clusters {} and {} are on different routes",
                        survivor, absorbed
                    ),
                });
            }
            if !keep.plates_compatible(&gone) {
                return Err(ClusterError::PlateMismatch {
                    cluster_id: survivor,
                    recorded: keep.plate.unwrap_or_default(),
                    presented: gone.plate.unwrap_or_default(),
                });
            }

            tx.execute(
                "UPDATE memberships SET cluster_id = ?1 WHERE cluster_id = ?2",
                params![survivor as i64, absorbed as i64],
            )?;
            tx.execute(
                "UPDATE clusters
                 SET plate = COALESCE(plate, ?2), plate_conflicts = plate_conflicts + ?3
                 WHERE id = ?1",
                params![survivor as i64, gone.plate, gone.plate_conflicts],
            )?;
            refresh(tx, absorbed, now)?;
            let (cluster, _) = refresh(tx, survivor, now)?;
            touched.extend([survivor, absorbed]);
            Ok(cluster)
        })
    }

    fn expire_idle(&self, older_than: i64) -> Result<ExpiryReport> {
        self.transact("expire_idle", |tx, touched| {
            let now = now_millis();
            let idle: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT user_id FROM memberships WHERE timestamp < ?1 ORDER BY user_id",
                )?;
                let rows = stmt.query_map(params![older_than], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut report = ExpiryReport::default();
            for user in idle {
                if let Some(departure) = detach(tx, &user, now, touched)? {
                    if departure.deactivated {
                        report.deactivated_clusters.push(departure.cluster.id);
                    }
                    report.expired_users.push(user);
                }
            }
            Ok(report)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ping;

    fn membership(user: &str, lat: f64) -> Membership {
        Membership::from_ping(&Ping::new(user, 1, GpsPoint::new(lat, -71.2400)), 0)
    }

    #[test]
    fn test_create_join_and_cache() {
        let store = SqliteClusterStore::in_memory().unwrap();
        let created = store.create_with_member(membership("a", -34.9800), None).unwrap();
        assert_eq!(created.cluster.member_count, 1);

        // Prime the cache, then mutate and make sure the cache was dropped
        assert_eq!(store.cluster(created.cluster.id).unwrap().unwrap().member_count, 1);
        let mut m = membership("b", -34.9802);
        m.cluster_id = created.cluster.id;
        store.place_member(m, Some("BXJK12".to_string())).unwrap();

        let cluster = store.cluster(created.cluster.id).unwrap().unwrap();
        assert_eq!(cluster.member_count, 2);
        assert_eq!(cluster.plate.as_deref(), Some("BXJK12"));
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = SqliteClusterStore::in_memory().unwrap();
        let created = store
            .create_with_member(membership("a", -34.9800), Some("BXJK12".to_string()))
            .unwrap();
        let other = store.create_with_member(membership("b", -34.9700), None).unwrap();

        let mut m = membership("b", -34.9800);
        m.cluster_id = created.cluster.id;
        assert!(store.place_member(m, Some("XXXX99".to_string())).is_err());

        // b is still in its own cluster, which is still active
        let b = store.membership("b").unwrap().unwrap();
        assert_eq!(b.cluster_id, other.cluster.id);
        assert!(store.cluster(other.cluster.id).unwrap().unwrap().active);
    }

    #[test]
    fn test_active_near_orders_by_distance() {
        let store = SqliteClusterStore::in_memory().unwrap();
        let far = store.create_with_member(membership("a", -34.9803), None).unwrap();
        let near = store.create_with_member(membership("b", -34.9801), None).unwrap();

        let found = store
            .active_near(1, &GpsPoint::new(-34.9800, -71.2400), 50.0)
            .unwrap();
        let ids: Vec<ClusterId> = found.iter().map(|n| n.cluster.id).collect();
        assert_eq!(ids, vec![near.cluster.id, far.cluster.id]);
    }
}
