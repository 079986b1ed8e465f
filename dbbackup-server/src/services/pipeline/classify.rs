//! Best-effort mapping of tool stderr to a short operator-facing summary.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Authentication,
    MissingDatabase,
    PermissionDenied,
    Timeout,
    UnreachableHost,
    Unclassified,
}

impl FailureKind {
    pub fn summary(&self) -> &'static str {
        match self {
            FailureKind::Authentication => {
                "Authentication failed: the username or password was rejected"
            }
            FailureKind::MissingDatabase => "Database error: the target database does not exist",
            FailureKind::PermissionDenied => {
                "Permission denied: the user lacks the privileges required for this operation"
            }
            FailureKind::Timeout => "Connection timed out while contacting the database server",
            FailureKind::UnreachableHost => {
                "Connection failed: the database server could not be reached, check host and port"
            }
            FailureKind::Unclassified => {
                "Unclassified failure: see the full log for details"
            }
        }
    }
}

const AUTHENTICATION: &[&str] = &[
    "password authentication failed",
    "authentication failed",
    "access denied for user",
    "auth error",
];

const MISSING_DATABASE: &[&str] = &["unknown database"];

const PERMISSION_DENIED: &[&str] = &[
    "permission denied",
    "insufficient privilege",
    "not authorized",
    "access denied",
];

const TIMEOUT: &[&str] = &["timeout expired", "timed out", "i/o timeout"];

const UNREACHABLE: &[&str] = &[
    "connection refused",
    "could not connect",
    "could not translate host name",
    "unknown mysql server host",
    "can't connect",
    "failed to connect",
    "no reachable servers",
    "no route to host",
    "name or service not known",
];

pub fn classify(stderr: &str) -> FailureKind {
    let text = stderr.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if any(AUTHENTICATION) {
        FailureKind::Authentication
    } else if any(MISSING_DATABASE) || (text.contains("database") && text.contains("does not exist")) {
        FailureKind::MissingDatabase
    } else if any(PERMISSION_DENIED) {
        FailureKind::PermissionDenied
    } else if any(TIMEOUT) {
        FailureKind::Timeout
    } else if any(UNREACHABLE) {
        FailureKind::UnreachableHost
    } else {
        FailureKind::Unclassified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_postgres_messages() {
        assert_eq!(
            classify("pg_dump: error: connection to server failed: FATAL:  password authentication failed for user \"app\""),
            FailureKind::Authentication
        );
        assert_eq!(
            classify("pg_dump: error: FATAL:  database \"missing\" does not exist"),
            FailureKind::MissingDatabase
        );
        assert_eq!(
            classify("pg_dump: error: could not translate host name \"nowhere\" to address"),
            FailureKind::UnreachableHost
        );
        assert_eq!(
            classify("pg_dump: error: query failed: ERROR:  permission denied for table secrets"),
            FailureKind::PermissionDenied
        );
        assert_eq!(classify("timeout expired"), FailureKind::Timeout);
    }

    #[test]
    fn test_classify_mysql_and_mongo_messages() {
        assert_eq!(
            classify("mysqldump: Got error: 1045: Access denied for user 'root'@'10.0.0.2' (using password: YES)"),
            FailureKind::Authentication
        );
        assert_eq!(
            classify("mysqldump: Got error: 1049: Unknown database 'shop'"),
            FailureKind::MissingDatabase
        );
        assert_eq!(
            classify("Failed: can't create session: could not connect to server: server selection error"),
            FailureKind::UnreachableHost
        );
    }

    #[test]
    fn test_unrecognized_output_is_unclassified() {
        assert_eq!(classify("segmentation fault"), FailureKind::Unclassified);
        assert_eq!(classify(""), FailureKind::Unclassified);
        assert!(FailureKind::Unclassified.summary().starts_with("Unclassified"));
    }
}
