//! Relational catalog: collections, grids, tiles, bands, cube descriptors and
//! the published items.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::models::catalog::{BandRow, Collection, ItemDraft, ItemRow, TileRow};
use crate::models::CubeDescriptor;

/// SRID of the builder grids, recorded on every published item.
pub const SRID_GRID: i64 = 100_002;
/// Application id stamped on items written by this service.
pub const APPLICATION_ID: i64 = 2;

pub struct CatalogDb {
    conn: Mutex<Connection>,
}

impl CatalogDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self { conn: Mutex::new(conn) };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS grid_ref_sys (
                id   INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS tiles (
                id              INTEGER PRIMARY KEY,
                grid_ref_sys_id INTEGER NOT NULL REFERENCES grid_ref_sys(id),
                name            TEXT NOT NULL,
                geom            TEXT NOT NULL,
                xmin            REAL NOT NULL,
                ymax            REAL NOT NULL,
                dist_x          REAL NOT NULL,
                dist_y          REAL NOT NULL,
                UNIQUE(grid_ref_sys_id, name)
            );

            CREATE TABLE IF NOT EXISTS collections (
                id              INTEGER PRIMARY KEY,
                name            TEXT NOT NULL,
                version         INTEGER NOT NULL,
                grid_ref_sys_id INTEGER NOT NULL REFERENCES grid_ref_sys(id),
                UNIQUE(name, version)
            );

            CREATE TABLE IF NOT EXISTS bands (
                id            INTEGER PRIMARY KEY,
                collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                name          TEXT NOT NULL,
                common_name   TEXT NOT NULL DEFAULT '',
                data_type     TEXT NOT NULL DEFAULT 'int16',
                UNIQUE(collection_id, name)
            );

            CREATE TABLE IF NOT EXISTS cubes (
                name       TEXT NOT NULL,
                version    INTEGER NOT NULL,
                descriptor TEXT NOT NULL,
                PRIMARY KEY (name, version)
            );

            CREATE TABLE IF NOT EXISTS items (
                id              TEXT PRIMARY KEY,
                collection_id   INTEGER NOT NULL REFERENCES collections(id),
                tile_id         INTEGER NOT NULL REFERENCES tiles(id),
                name            TEXT NOT NULL,
                start_date      TEXT NOT NULL,
                end_date        TEXT NOT NULL,
                cloud_cover     REAL NOT NULL DEFAULT 0,
                assets          TEXT NOT NULL DEFAULT '{}',
                geom            TEXT NOT NULL DEFAULT 'null',
                min_convex_hull TEXT NOT NULL DEFAULT 'null',
                srid            INTEGER NOT NULL,
                application_id  INTEGER NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                UNIQUE(collection_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_items_collection ON items(collection_id, start_date DESC);
            ",
        )?;
        Ok(())
    }

    /// Cheap reachability probe for the readiness endpoint.
    pub fn ping(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM collections", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ── Grid and tile operations ──

    pub fn create_grid(&self, id: i64, name: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO grid_ref_sys (id, name) VALUES (?1, ?2)",
            params![id, name],
        )?;
        Ok(())
    }

    pub fn create_tile(&self, tile: &TileRow) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO tiles (id, grid_ref_sys_id, name, geom, xmin, ymax, dist_x, dist_y) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tile.id,
                tile.grid_ref_sys_id,
                tile.name,
                tile.geom.to_string(),
                tile.xmin,
                tile.ymax,
                tile.dist_x,
                tile.dist_y,
            ],
        )?;
        Ok(())
    }

    /// Tiles of a grid by name, in the order the names were given.
    pub fn tiles_by_names(
        &self,
        grid_ref_sys_id: i64,
        names: &[String],
    ) -> anyhow::Result<Vec<TileRow>> {
        let mut tiles = Vec::new();
        for name in names {
            if let Some(tile) = self.get_tile(grid_ref_sys_id, name)? {
                tiles.push(tile);
            }
        }
        Ok(tiles)
    }

    pub fn get_tile(&self, grid_ref_sys_id: i64, name: &str) -> anyhow::Result<Option<TileRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, grid_ref_sys_id, name, geom, xmin, ymax, dist_x, dist_y \
             FROM tiles WHERE grid_ref_sys_id = ?1 AND name = ?2",
        )?;
        let row = stmt
            .query_row(params![grid_ref_sys_id, name], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                ))
            })
            .optional()?;
        row.map(|(id, grid, name, geom, xmin, ymax, dist_x, dist_y)| -> anyhow::Result<TileRow> {
            Ok(TileRow {
                id,
                grid_ref_sys_id: grid,
                name,
                geom: serde_json::from_str(&geom)?,
                xmin,
                ymax,
                dist_x,
                dist_y,
            })
        })
        .transpose()
    }

    // ── Collection and band operations ──

    pub fn create_collection(
        &self,
        name: &str,
        version: i64,
        grid_ref_sys_id: i64,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO collections (name, version, grid_ref_sys_id) VALUES (?1, ?2, ?3)",
            params![name, version, grid_ref_sys_id],
        )?;
        let id = conn.query_row(
            "SELECT id FROM collections WHERE name = ?1 AND version = ?2",
            params![name, version],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_collection(&self, name: &str, version: i64) -> anyhow::Result<Option<Collection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, version, grid_ref_sys_id FROM collections \
             WHERE name = ?1 AND version = ?2",
        )?;
        let row = stmt
            .query_row(params![name, version], |row| {
                Ok(Collection {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    version: row.get(2)?,
                    grid_ref_sys_id: row.get(3)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn create_band(
        &self,
        collection_id: i64,
        name: &str,
        common_name: &str,
        data_type: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO bands (collection_id, name, common_name, data_type) \
             VALUES (?1, ?2, ?3, ?4)",
            params![collection_id, name, common_name, data_type],
        )?;
        Ok(())
    }

    pub fn bands_by_collection(&self, collection_id: i64) -> anyhow::Result<Vec<BandRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, collection_id, name, common_name, data_type FROM bands \
             WHERE collection_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![collection_id], |row| {
                Ok(BandRow {
                    id: row.get(0)?,
                    collection_id: row.get(1)?,
                    name: row.get(2)?,
                    common_name: row.get(3)?,
                    data_type: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Cube descriptor registry ──

    pub fn save_cube(&self, cube: &CubeDescriptor) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cubes (name, version, descriptor) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name, version) DO UPDATE SET descriptor = ?3",
            params![cube.name, i64::from(cube.version), serde_json::to_string(cube)?],
        )?;
        Ok(())
    }

    pub fn get_cube(&self, name: &str, version: u32) -> anyhow::Result<Option<CubeDescriptor>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT descriptor FROM cubes WHERE name = ?1 AND version = ?2")?;
        let json = stmt
            .query_row(params![name, i64::from(version)], |row| row.get::<_, String>(0))
            .optional()?;
        json.map(|j| Ok(serde_json::from_str(&j)?)).transpose()
    }

    // ── Item operations ──

    /// Commit one `(tile, period)`'s items in a single transaction. Existing
    /// `(collection, name)` entries are updated in place.
    pub fn commit_items(&self, items: &[ItemDraft]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for item in items {
            tx.execute(
                "INSERT INTO items (id, collection_id, tile_id, name, start_date, end_date, \
                 cloud_cover, assets, geom, min_convex_hull, srid, application_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(collection_id, name) DO UPDATE SET \
                 start_date = ?5, end_date = ?6, cloud_cover = ?7, assets = ?8, geom = ?9, \
                 min_convex_hull = ?10, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    item.collection_id,
                    item.tile_id,
                    item.name,
                    item.start_date,
                    item.end_date,
                    item.cloud_cover,
                    item.assets.to_string(),
                    item.geom.to_string(),
                    item.min_convex_hull.to_string(),
                    item.srid,
                    item.application_id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_item(&self, collection_id: i64, name: &str) -> anyhow::Result<Option<ItemRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, collection_id, tile_id, name, start_date, end_date, cloud_cover, \
             assets, geom, min_convex_hull, srid, application_id, created_at, updated_at \
             FROM items WHERE collection_id = ?1 AND name = ?2",
        )?;
        let row = stmt
            .query_row(params![collection_id, name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, i64>(11)?,
                    row.get::<_, String>(12)?,
                    row.get::<_, String>(13)?,
                ))
            })
            .optional()?;
        row.map(
            |(id, collection_id, tile_id, name, start, end, cc, assets, geom, hull, srid, app, created, updated)| -> anyhow::Result<ItemRow> {
                Ok(ItemRow {
                    id,
                    collection_id,
                    tile_id,
                    name,
                    start_date: start,
                    end_date: end,
                    cloud_cover: cc,
                    assets: serde_json::from_str(&assets)?,
                    geom: serde_json::from_str(&geom)?,
                    min_convex_hull: serde_json::from_str(&hull)?,
                    srid,
                    application_id: app,
                    created_at: created,
                    updated_at: updated,
                })
            },
        )
        .transpose()
    }
}
