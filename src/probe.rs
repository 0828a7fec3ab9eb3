//! Connection activity probe: infers "someone is using the server" from the
//! kernel TCP table instead of asking the server.
//!
//! Each table is line oriented: one header line, then one whitespace-separated
//! record per socket, e.g.
//!
//! ```text
//!   sl  local_address rem_address   st tx_queue rx_queue ...
//!    0: 0100007F:1F90 0100007F:C4A2 01 00000000:00000000 ...
//! ```
//!
//! The second field is `ADDR:PORT` in hex, the fourth the state code.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Answers "is anything currently connected to this port?".
///
/// Implementations never fail: a backend that cannot observe anything
/// reports `false`, which the idle controller treats as "no activity".
pub trait ActivityProbe {
    fn has_active_connection(&self, port: u16) -> bool;
}

/// TCP socket states as encoded in `/proc/net/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Established,
    Listen,
    Close,
    Other(u8),
}

impl TcpState {
    fn from_code(code: u8) -> Self {
        match code {
            0x01 => TcpState::Established,
            0x07 => TcpState::Close,
            0x0A => TcpState::Listen,
            other => TcpState::Other(other),
        }
    }
}

/// One row of the connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub local_port: u16,
    pub state: TcpState,
}

impl ConnectionRecord {
    /// Parse one record line. Returns `None` for anything malformed.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let _slot = fields.next()?;
        let local_address = fields.next()?;
        let _remote_address = fields.next()?;
        let state = fields.next()?;

        let (_addr, port_hex) = local_address.rsplit_once(':')?;
        let local_port = u16::from_str_radix(port_hex, 16).ok()?;
        if state.len() != 2 {
            return None;
        }
        let code = u8::from_str_radix(state, 16).ok()?;

        Some(Self {
            local_port,
            state: TcpState::from_code(code),
        })
    }
}

/// Iterate the well-formed records of a table, skipping the header.
pub fn parse_table(contents: &str) -> impl Iterator<Item = ConnectionRecord> + '_ {
    contents.lines().skip(1).filter_map(ConnectionRecord::parse)
}

/// True if any record in `contents` is an established connection on `port`.
pub fn table_has_established(contents: &str, port: u16) -> bool {
    parse_table(contents)
        .any(|record| record.local_port == port && record.state == TcpState::Established)
}

/// Linux backend reading `/proc/net/tcp` and `/proc/net/tcp6`.
///
/// A missing or unreadable table counts as "no activity". The first failure
/// is logged as a warning, later ones only at debug level so a host without
/// procfs does not flood the log once per poll.
pub struct ProcNetTcp {
    tables: Vec<PathBuf>,
    warned: AtomicBool,
}

impl ProcNetTcp {
    pub fn new(tables: Vec<PathBuf>) -> Self {
        Self {
            tables,
            warned: AtomicBool::new(false),
        }
    }

    #[allow(dead_code)]
    pub fn tables(&self) -> &[PathBuf] {
        &self.tables
    }
}

impl Default for ProcNetTcp {
    fn default() -> Self {
        Self::new(vec![
            PathBuf::from("/proc/net/tcp"),
            PathBuf::from("/proc/net/tcp6"),
        ])
    }
}

impl ActivityProbe for ProcNetTcp {
    fn has_active_connection(&self, port: u16) -> bool {
        for table in &self.tables {
            match std::fs::read_to_string(table) {
                Ok(contents) => {
                    if table_has_established(&contents, port) {
                        tracing::trace!(
                            port,
                            table = %table.display(),
                            "established connection seen"
                        );
                        return true;
                    }
                }
                Err(e) => {
                    if self.warned.swap(true, Ordering::Relaxed) {
                        tracing::debug!(
                            error = %e,
                            table = %table.display(),
                            "connection table unreadable"
                        );
                    } else {
                        tracing::warn!(
                            error = %e,
                            table = %table.display(),
                            "connection table unreadable, treating as no activity"
                        );
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    fn table(rows: &[&str]) -> String {
        let mut out = String::from(HEADER);
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out.push('\n');
        out
    }

    // 0x1F90 == 8080
    const LISTEN_8080: &str = "   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1";
    const ESTABLISHED_8080: &str = "   1: 0100007F:1F90 0100007F:C4A2 01 00000000:00000000 00:00000000 00000000  1000        0 12346 1";
    const ESTABLISHED_22: &str = "   2: 0100007F:0016 0100007F:D001 01 00000000:00000000 00:00000000 00000000     0        0 12347 1";
    const TIME_WAIT_8080: &str = "   3: 0100007F:1F90 0100007F:C4A4 06 00000000:00000000 03:00000F2A 00000000     0        0 0 3";

    #[test]
    fn test_parse_record_fields() {
        let record = ConnectionRecord::parse(ESTABLISHED_8080).unwrap();
        assert_eq!(record.local_port, 8080);
        assert_eq!(record.state, TcpState::Established);

        let record = ConnectionRecord::parse(LISTEN_8080).unwrap();
        assert_eq!(record.state, TcpState::Listen);

        let record = ConnectionRecord::parse(TIME_WAIT_8080).unwrap();
        assert_eq!(record.state, TcpState::Other(0x06));
    }

    #[test]
    fn test_parse_ipv6_local_address() {
        let row = "   0: 0000000000000000FFFF00000100007F:1F90 0000000000000000FFFF00000100007F:E2B4 01 00000000:00000000 00:00000000 00000000  1000        0 99 1";
        let record = ConnectionRecord::parse(row).unwrap();
        assert_eq!(record.local_port, 8080);
        assert_eq!(record.state, TcpState::Established);
    }

    #[test]
    fn test_malformed_rows_are_none() {
        assert_eq!(ConnectionRecord::parse(""), None);
        assert_eq!(ConnectionRecord::parse("   0: 0100007F1F90 0100007F:C4A2 01"), None);
        assert_eq!(ConnectionRecord::parse("   0: 0100007F:ZZZZ 0100007F:C4A2 01"), None);
        assert_eq!(ConnectionRecord::parse("   0: 0100007F:1F90 0100007F:C4A2"), None);
        assert_eq!(ConnectionRecord::parse("   0: 0100007F:1F90 0100007F:C4A2 1"), None);
        assert_eq!(ConnectionRecord::parse("   0: 0100007F:1FFFF0 0100007F:C4A2 01"), None);
    }

    #[test]
    fn test_no_rows_is_no_activity() {
        assert!(!table_has_established(&table(&[]), 8080));
        assert!(!table_has_established("", 8080));
    }

    #[test]
    fn test_listening_only_is_no_activity() {
        assert!(!table_has_established(&table(&[LISTEN_8080]), 8080));
    }

    #[test]
    fn test_established_on_other_port_is_no_activity() {
        assert!(!table_has_established(&table(&[LISTEN_8080, ESTABLISHED_22]), 8080));
    }

    #[test]
    fn test_non_established_states_on_port_are_no_activity() {
        assert!(!table_has_established(&table(&[TIME_WAIT_8080]), 8080));
    }

    #[test]
    fn test_established_on_port_is_activity() {
        let contents = table(&[LISTEN_8080, ESTABLISHED_22, ESTABLISHED_8080]);
        assert!(table_has_established(&contents, 8080));
        assert!(table_has_established(&contents, 22));
    }

    #[test]
    fn test_malformed_row_does_not_hide_later_match() {
        let contents = table(&[
            "garbage",
            "   9: 0100007F 0100007F:C4A2 01",
            "   9: 0100007F:XYZ 0100007F:C4A2 01",
            "   9:",
            ESTABLISHED_8080,
        ]);
        assert!(table_has_established(&contents, 8080));
    }

    #[test]
    fn test_header_line_is_skipped() {
        // A header that happens to look like a matching record is not counted.
        let contents = format!("{ESTABLISHED_8080}\n{LISTEN_8080}\n");
        assert!(!table_has_established(&contents, 8080));
    }

    #[test]
    fn test_proc_probe_reads_tables() {
        let dir = tempdir().unwrap();
        let tcp = dir.path().join("tcp");
        let tcp6 = dir.path().join("tcp6");
        std::fs::write(&tcp, table(&[LISTEN_8080])).unwrap();
        std::fs::write(&tcp6, table(&[ESTABLISHED_8080])).unwrap();

        let probe = ProcNetTcp::new(vec![tcp.clone()]);
        assert!(!probe.has_active_connection(8080));

        let probe = ProcNetTcp::new(vec![tcp, tcp6]);
        assert!(probe.has_active_connection(8080));
    }

    #[test]
    fn test_proc_probe_missing_table_is_false() {
        let dir = tempdir().unwrap();
        let probe = ProcNetTcp::new(vec![dir.path().join("absent")]);
        assert!(!probe.has_active_connection(8080));
        // Repeated failures stay quiet and still report no activity.
        assert!(!probe.has_active_connection(8080));
    }

    #[test]
    fn test_proc_probe_skips_unreadable_table() {
        let dir = tempdir().unwrap();
        let tcp6 = dir.path().join("tcp6");
        std::fs::write(&tcp6, table(&[ESTABLISHED_8080])).unwrap();
        let probe = ProcNetTcp::new(vec![dir.path().join("absent"), tcp6]);
        assert!(probe.has_active_connection(8080));
    }

    #[test]
    fn test_default_tables() {
        let probe = ProcNetTcp::default();
        assert_eq!(
            probe.tables(),
            [PathBuf::from("/proc/net/tcp"), PathBuf::from("/proc/net/tcp6")]
        );
    }
}
