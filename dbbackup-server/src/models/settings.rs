use rusqlite::{params, Connection};

use crate::models::package::PackageConfig;

const PACKAGE_CONFIG_KEY: &str = "package_config";

pub fn get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?")?;
    let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

pub fn set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn package_config(conn: &Connection) -> anyhow::Result<PackageConfig> {
    match get(conn, PACKAGE_CONFIG_KEY)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(PackageConfig::default()),
    }
}

pub fn set_package_config(conn: &Connection, config: &PackageConfig) -> anyhow::Result<()> {
    set(conn, PACKAGE_CONFIG_KEY, &serde_json::to_string(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use crate::models::package::PackageFormat;

    #[test]
    fn test_package_config_roundtrip_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        assert_eq!(package_config(&conn).unwrap(), PackageConfig::default());

        let config = PackageConfig {
            schedule: Some("0 3 * * *".into()),
            compression: PackageFormat::TarGz,
            retention_days: Some(30),
            max_count: Some(5),
        };
        set_package_config(&conn, &config).unwrap();
        assert_eq!(package_config(&conn).unwrap(), config);
    }
}
