use super::super::common::MockConnector;
use qan_agent::mysql::slow_log_file;
use std::path::PathBuf;

#[tokio::test]
async fn test_relative_slow_log_is_under_datadir() {
    let conn = MockConnector::new()
        .with_var("slow_query_log_file", "db1-slow.log")
        .with_var("datadir", "/var/lib/mysql/");

    assert_eq!(
        slow_log_file(&conn).await.unwrap(),
        PathBuf::from("/var/lib/mysql/db1-slow.log")
    );
}

#[tokio::test]
async fn test_absolute_slow_log_is_kept() {
    let conn = MockConnector::new()
        .with_var("slow_query_log_file", "/var/log/mysql/slow.log")
        .with_var("datadir", "/var/lib/mysql/");

    assert_eq!(
        slow_log_file(&conn).await.unwrap(),
        PathBuf::from("/var/log/mysql/slow.log")
    );
}

#[tokio::test]
async fn test_unset_slow_log_is_an_error() {
    let conn = MockConnector::new().with_var("slow_query_log_file", "");
    assert!(slow_log_file(&conn).await.is_err());
}
