use anyhow::Result;
use common::Version;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::sqlite::SqliteConnection;

use crate::schema::*;
use crate::utils::sha256_hex;

const INIT_SQL: &str = include_str!("../migrations/2024-01-01-000000_init/up.sql");

pub mod models {
    use crate::schema::*;
    use diesel::prelude::*;

    #[derive(Debug, Clone, Queryable, serde::Serialize)]
    pub struct Device {
        pub device_id: String, // unique, key
        #[serde(skip)]
        pub credential_hash: String,
        pub approved: bool,
        pub claimed: bool,
        pub mac_address: Option<String>,
        pub firmware_version: String,
        pub reading_interval: i32, // s
        pub created_at: i64,       // s
        pub last_seen: Option<i64>, // s
        pub total_readings: i64,
    }

    #[derive(Debug, Insertable)]
    #[diesel(table_name = devices)]
    pub struct NewDevice<'a> {
        pub device_id: &'a str,
        pub credential_hash: &'a str,
        pub mac_address: Option<&'a str>,
        pub firmware_version: &'a str,
        pub reading_interval: i32,
        pub created_at: i64,
    }

    #[derive(Debug, Clone, Insertable)]
    #[diesel(table_name = readings)]
    pub struct NewReading {
        pub device_id: String,
        pub sensor: String,
        pub value: f64,
        pub unit: String,
        pub device_timestamp: Option<i64>,
        pub received_at: i64,
    }

    #[derive(Debug, Clone, Queryable, serde::Serialize)]
    pub struct Reading {
        pub id: i32,
        pub device_id: String,
        pub sensor: String,
        pub value: f64,
        pub unit: String,
        pub device_timestamp: Option<i64>,
        pub received_at: i64,
    }

    /// Release metadata; the binary itself is only loaded on download.
    #[derive(Debug, Clone, Queryable, Selectable, serde::Serialize)]
    #[diesel(table_name = firmware)]
    pub struct FirmwareRelease {
        pub version: String,
        pub checksum: String,
        pub size: i64,
        pub url: String,
        pub active: bool,
        pub uploaded_at: i64,
        pub download_count: i32,
    }

    #[derive(Debug, Insertable)]
    #[diesel(table_name = firmware)]
    pub struct NewRelease<'a> {
        pub version: &'a str,
        pub checksum: &'a str,
        pub size: i64,
        pub url: &'a str,
        pub active: bool,
        pub uploaded_at: i64,
        pub data: &'a [u8],
    }

    #[derive(Debug, Clone, Queryable, serde::Serialize)]
    pub struct DeviceUpdate {
        pub id: i32,
        pub device_id: String,
        pub previous_version: Option<String>,
        pub new_version: String,
        pub status: String,
        pub error_message: Option<String>,
        pub started_at: i64,
        pub completed_at: Option<i64>,
    }

    #[derive(Debug, Insertable)]
    #[diesel(table_name = device_updates)]
    pub struct NewDeviceUpdate<'a> {
        pub device_id: &'a str,
        pub previous_version: Option<&'a str>,
        pub new_version: &'a str,
        pub status: &'a str,
        pub error_message: Option<&'a str>,
        pub started_at: i64,
        pub completed_at: Option<i64>,
    }
}

use models::*;

pub mod update_status {
    pub const DOWNLOADING: &str = "downloading";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
    pub const ROLLED_BACK: &str = "rolled_back";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// Unapproved, never used credential replaced by a fresh one.
    Reissued,
    Conflict(&'static str),
}

#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Device registry and firmware release store.
///
/// Every mutation touching a device row runs in its own immediate transaction,
/// so concurrent requests for different devices never wait on each other beyond
/// SQLite's own write serialisation.
#[derive(Clone)]
pub struct Db {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Db {
    pub fn connect(database_url: &str, pool_size: u32) -> Result<Self> {
        let in_memory = database_url == ":memory:";
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);

        let mut builder = Pool::builder()
            .max_size(if in_memory { 1 } else { pool_size.max(1) })
            .connection_customizer(Box::new(SqlitePragmas));
        if in_memory {
            // every new connection would be a new, empty database
            builder = builder.idle_timeout(None).max_lifetime(None);
        }
        let pool = builder.build(manager)?;

        let db = Self { pool };
        db.with_conn(|conn| {
            if !in_memory {
                conn.batch_execute("PRAGMA journal_mode = WAL;")?;
            }
            conn.batch_execute(INIT_SQL)?;
            Ok(())
        })?;

        log::info!("Database ready ({database_url})");
        Ok(db)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T>) -> Result<T> {
        let mut conn = self.pool.get()?;
        f(&mut conn)
    }

    // ===============================================
    // device registry
    // ===============================================

    pub fn register_device(&self, new: &NewDevice) -> Result<Registration> {
        self.with_conn(|conn| {
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let existing = devices::table
                    .find(new.device_id)
                    .first::<Device>(conn)
                    .optional()?;

                let Some(existing) = existing else {
                    diesel::insert_into(devices::table)
                        .values(new)
                        .execute(conn)?;
                    return Ok(Registration::Created);
                };

                if existing.approved {
                    return Ok(Registration::Conflict("device is already registered"));
                }
                if existing.claimed {
                    return Ok(Registration::Conflict("device is already claimed"));
                }
                if existing.mac_address.is_some()
                    && existing.mac_address.as_deref() != new.mac_address
                {
                    return Ok(Registration::Conflict("device is already registered"));
                }

                diesel::update(devices::table.find(new.device_id))
                    .set((
                        devices::credential_hash.eq(new.credential_hash),
                        devices::firmware_version.eq(new.firmware_version),
                        devices::mac_address
                            .eq(new.mac_address.or(existing.mac_address.as_deref())),
                    ))
                    .execute(conn)?;
                Ok(Registration::Reissued)
            })
        })
    }

    pub fn device(&self, device_id: &str) -> Result<Option<Device>> {
        self.with_conn(|conn| {
            Ok(devices::table
                .find(device_id)
                .first::<Device>(conn)
                .optional()?)
        })
    }

    pub fn devices(&self) -> Result<Vec<Device>> {
        self.with_conn(|conn| {
            Ok(devices::table
                .order(devices::device_id.asc())
                .load::<Device>(conn)?)
        })
    }

    /// Records that the device proved possession of its credential.
    pub fn mark_claimed(&self, device_id: &str, now: i64) -> Result<()> {
        self.with_conn(|conn| {
            diesel::update(devices::table.find(device_id))
                .set((devices::claimed.eq(true), devices::last_seen.eq(now)))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn approve_device(&self, device_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = diesel::update(devices::table.find(device_id))
                .set(devices::approved.eq(true))
                .execute(conn)?;
            Ok(n > 0)
        })
    }

    pub fn set_reading_interval(&self, device_id: &str, interval: i32) -> Result<bool> {
        self.with_conn(|conn| {
            let n = diesel::update(devices::table.find(device_id))
                .set(devices::reading_interval.eq(interval))
                .execute(conn)?;
            Ok(n > 0)
        })
    }

    pub fn set_firmware_version(&self, device_id: &str, version: &str, now: i64) -> Result<()> {
        self.with_conn(|conn| {
            diesel::update(devices::table.find(device_id))
                .set((
                    devices::firmware_version.eq(version),
                    devices::last_seen.eq(now),
                ))
                .execute(conn)?;
            Ok(())
        })
    }

    /// Stores all `rows` and bumps the device counters as one unit.
    /// Returns the device's reading total before this batch.
    pub fn store_readings(
        &self,
        device_id: &str,
        rows: &[NewReading],
        firmware_version: Option<&str>,
        now: i64,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let previous: i64 = devices::table
                    .find(device_id)
                    .select(devices::total_readings)
                    .first(conn)?;

                for row in rows {
                    diesel::insert_into(readings::table)
                        .values(row)
                        .execute(conn)?;
                }

                diesel::update(devices::table.find(device_id))
                    .set((
                        devices::total_readings.eq(devices::total_readings + rows.len() as i64),
                        devices::last_seen.eq(now),
                    ))
                    .execute(conn)?;

                if let Some(version) = firmware_version {
                    diesel::update(devices::table.find(device_id))
                        .set(devices::firmware_version.eq(version))
                        .execute(conn)?;
                }

                Ok(previous)
            })
        })
    }

    pub fn readings(&self, device_id: &str, limit: i64) -> Result<Vec<Reading>> {
        self.with_conn(|conn| {
            Ok(readings::table
                .filter(readings::device_id.eq(device_id))
                .order((readings::received_at.desc(), readings::id.desc()))
                .limit(limit)
                .load::<Reading>(conn)?)
        })
    }

    pub fn reading_count(&self, device_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(readings::table
                .filter(readings::device_id.eq(device_id))
                .count()
                .get_result(conn)?)
        })
    }

    // ===============================================
    // firmware release store
    // ===============================================

    /// Returns `None` if the version already exists.
    pub fn insert_release(
        &self,
        version: &str,
        data: &[u8],
        now: i64,
    ) -> Result<Option<FirmwareRelease>> {
        let checksum = sha256_hex(data);
        let url = format!("/ota/download/{version}");

        self.with_conn(|conn| {
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let exists = firmware::table
                    .find(version)
                    .select(firmware::version)
                    .first::<String>(conn)
                    .optional()?
                    .is_some();
                if exists {
                    return Ok(None);
                }

                diesel::insert_into(firmware::table)
                    .values(&NewRelease {
                        version,
                        checksum: &checksum,
                        size: data.len() as i64,
                        url: &url,
                        active: true,
                        uploaded_at: now,
                        data,
                    })
                    .execute(conn)?;

                Ok(firmware::table
                    .find(version)
                    .select(FirmwareRelease::as_select())
                    .first(conn)
                    .optional()?)
            })
        })
    }

    pub fn set_release_active(&self, version: &str, active: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let n = diesel::update(firmware::table.find(version))
                .set(firmware::active.eq(active))
                .execute(conn)?;
            Ok(n > 0)
        })
    }

    pub fn release(&self, version: &str) -> Result<Option<FirmwareRelease>> {
        self.with_conn(|conn| {
            Ok(firmware::table
                .find(version)
                .select(FirmwareRelease::as_select())
                .first(conn)
                .optional()?)
        })
    }

    /// The active release with the greatest semantic version.
    pub fn latest_release(&self) -> Result<Option<FirmwareRelease>> {
        let active = self.with_conn(|conn| {
            Ok(firmware::table
                .filter(firmware::active.eq(true))
                .select(FirmwareRelease::as_select())
                .load(conn)?)
        })?;

        Ok(active
            .into_iter()
            .filter_map(|r| r.version.parse::<Version>().ok().map(|v| (v, r)))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, r)| r))
    }

    /// Metadata and binary of an active release.
    pub fn release_binary(&self, version: &str) -> Result<Option<(FirmwareRelease, Vec<u8>)>> {
        self.with_conn(|conn| {
            let release = firmware::table
                .find(version)
                .filter(firmware::active.eq(true))
                .select(FirmwareRelease::as_select())
                .first(conn)
                .optional()?;
            let Some(release) = release else {
                return Ok(None);
            };

            let data = firmware::table
                .find(version)
                .select(firmware::data)
                .first::<Vec<u8>>(conn)?;
            Ok(Some((release, data)))
        })
    }

    // ===============================================
    // update history
    // ===============================================

    pub fn record_download(&self, device: &Device, version: &str, now: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                diesel::insert_into(device_updates::table)
                    .values(&NewDeviceUpdate {
                        device_id: &device.device_id,
                        previous_version: Some(&device.firmware_version),
                        new_version: version,
                        status: update_status::DOWNLOADING,
                        error_message: None,
                        started_at: now,
                        completed_at: None,
                    })
                    .execute(conn)?;

                diesel::update(firmware::table.find(version))
                    .set(firmware::download_count.eq(firmware::download_count + 1))
                    .execute(conn)?;
                Ok(())
            })
        })
    }

    /// Completes the newest in-flight attempt for `version`, or records a new
    /// finished one when the download was never seen.
    pub fn report_update(
        &self,
        device: &Device,
        version: &str,
        status: &str,
        error: Option<&str>,
        now: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let pending = device_updates::table
                    .filter(device_updates::device_id.eq(&device.device_id))
                    .filter(device_updates::new_version.eq(version))
                    .filter(device_updates::status.eq(update_status::DOWNLOADING))
                    .order(device_updates::id.desc())
                    .select(device_updates::id)
                    .first::<i32>(conn)
                    .optional()?;

                match pending {
                    Some(id) => {
                        diesel::update(device_updates::table.find(id))
                            .set((
                                device_updates::status.eq(status),
                                device_updates::error_message.eq(error),
                                device_updates::completed_at.eq(now),
                            ))
                            .execute(conn)?;
                    }
                    None => {
                        diesel::insert_into(device_updates::table)
                            .values(&NewDeviceUpdate {
                                device_id: &device.device_id,
                                previous_version: Some(&device.firmware_version),
                                new_version: version,
                                status,
                                error_message: error,
                                started_at: now,
                                completed_at: Some(now),
                            })
                            .execute(conn)?;
                    }
                }
                Ok(())
            })
        })
    }

    /// Marks the newest in-flight attempt for `version` as successful, if any.
    pub fn complete_download(&self, device_id: &str, version: &str, now: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let pending = device_updates::table
                .filter(device_updates::device_id.eq(device_id))
                .filter(device_updates::new_version.eq(version))
                .filter(device_updates::status.eq(update_status::DOWNLOADING))
                .order(device_updates::id.desc())
                .select(device_updates::id)
                .first::<i32>(conn)
                .optional()?;

            let Some(id) = pending else {
                return Ok(false);
            };
            diesel::update(device_updates::table.find(id))
                .set((
                    device_updates::status.eq(update_status::SUCCESS),
                    device_updates::completed_at.eq(now),
                ))
                .execute(conn)?;
            Ok(true)
        })
    }

    pub fn updates(&self, device_id: &str) -> Result<Vec<DeviceUpdate>> {
        self.with_conn(|conn| {
            Ok(device_updates::table
                .filter(device_updates::device_id.eq(device_id))
                .order(device_updates::id.desc())
                .load::<DeviceUpdate>(conn)?)
        })
    }
}
