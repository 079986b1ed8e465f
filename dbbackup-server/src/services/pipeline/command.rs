use crate::config::ToolPaths;
use crate::models::resource::{EngineKind, Resource};
use tokio::process::Command;

/// Dump command writing the archive to stdout.
pub fn dump_command(resource: &Resource, tools: &ToolPaths) -> Command {
    let port = resource.port.to_string();
    match resource.engine {
        EngineKind::Postgres => {
            let mut cmd = Command::new(&tools.pg_dump);
            cmd.args(["-h", &resource.host, "-p", &port, "-U", &resource.username])
                .args(["-d", &resource.database_name, "-Fc", "--no-password"])
                .env("PGPASSWORD", &resource.password);
            cmd
        }
        EngineKind::MySql => {
            let mut cmd = Command::new(&tools.mysqldump);
            cmd.args(["--protocol=TCP", "-h", &resource.host, "-P", &port, "-u", &resource.username])
                .args(["--single-transaction", "--quick", "--routines", &resource.database_name])
                .env("MYSQL_PWD", &resource.password);
            cmd
        }
        EngineKind::MongoDb => {
            let mut cmd = Command::new(&tools.mongodump);
            cmd.args(mongo_connection_args(resource))
                .args(["--db", &resource.database_name, "--archive", "--quiet"]);
            cmd
        }
    }
}

/// Restore command reading the archive from stdin.
pub fn restore_command(resource: &Resource, tools: &ToolPaths) -> Command {
    let port = resource.port.to_string();
    match resource.engine {
        EngineKind::Postgres => {
            let mut cmd = Command::new(&tools.pg_restore);
            cmd.args(["-h", &resource.host, "-p", &port, "-U", &resource.username])
                .args(["-d", &resource.database_name, "--clean", "--if-exists", "--no-owner", "--no-password"])
                .env("PGPASSWORD", &resource.password);
            cmd
        }
        EngineKind::MySql => {
            let mut cmd = Command::new(&tools.mysql);
            cmd.args(["--protocol=TCP", "-h", &resource.host, "-P", &port, "-u", &resource.username])
                .arg(&resource.database_name)
                .env("MYSQL_PWD", &resource.password);
            cmd
        }
        EngineKind::MongoDb => {
            let mut cmd = Command::new(&tools.mongorestore);
            cmd.args(mongo_connection_args(resource))
                .args(["--archive", "--drop", "--quiet"]);
            cmd
        }
    }
}

fn mongo_connection_args(resource: &Resource) -> Vec<String> {
    vec![
        format!("--host={}", resource.host),
        format!("--port={}", resource.port),
        format!("--username={}", resource.username),
        format!("--password={}", resource.password),
        "--authenticationDatabase=admin".to_string(),
    ]
}

pub fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}
