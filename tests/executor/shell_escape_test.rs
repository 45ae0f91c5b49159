//! Shell quoting tests for words sent to the remote shell.

use nextcloud_backup::executor::shell_quote;

#[test]
fn simple_string_is_quoted() {
    assert_eq!(shell_quote("/backups/nextcloud"), "'/backups/nextcloud'");
}

#[test]
fn single_quotes_are_escaped() {
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
}

#[test]
fn empty_string_produces_empty_quotes() {
    assert_eq!(shell_quote(""), "''");
}

#[test]
fn metacharacters_are_inert() {
    assert_eq!(
        shell_quote("nextcloud_backup_*.tar.gz; rm -rf /"),
        "'nextcloud_backup_*.tar.gz; rm -rf /'"
    );
    assert_eq!(shell_quote("$HOME"), "'$HOME'");
}
