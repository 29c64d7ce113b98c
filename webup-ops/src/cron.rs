use std::{
    io::{self, Error, ErrorKind, Write},
    process::{Command, Stdio},
};

use chrono::{DateTime, Local};
use log::info;

/// Formats one crontab line firing at the given wall-clock minute/hour,
/// every day.
pub fn entry_at(when: &DateTime<Local>, command: &str) -> String {
    format!(
        "{} {} * * * {}",
        when.format("%M"),
        when.format("%H"),
        command
    )
}

/// Appends one entry to the table text, preserving the existing lines.
/// No de-duplication: scheduling twice yields two entries.
pub fn append_entry(existing: &str, entry: &str) -> String {
    let trimmed = existing.trim_end();
    if trimmed.is_empty() {
        format!("{}\n", entry)
    } else {
        format!("{}\n{}\n", trimmed, entry)
    }
}

/// Reads the current user's crontab; a missing table reads as empty.
pub fn read_table() -> io::Result<String> {
    let output = Command::new("crontab").arg("-l").output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Ok(String::new())
    }
}

/// Rewrites the crontab with the given table text.
pub fn install_table(table: &str) -> io::Result<()> {
    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::new(ErrorKind::Other, "failed to open crontab stdin"))?;
    stdin.write_all(table.as_bytes())?;
    drop(stdin);

    let status = child.wait()?;
    if !status.success() {
        return Err(Error::new(
            ErrorKind::Other,
            format!("crontab install failed with status {:?}", status.code()),
        ));
    }
    Ok(())
}

/// Read-modify-write of the full job table: append one entry firing at
/// "when" and reinstall.
pub fn schedule(when: &DateTime<Local>, command: &str) -> io::Result<()> {
    let entry = entry_at(when, command);
    info!("scheduling cron entry: {}", entry);

    let existing = read_table()?;
    install_table(&append_entry(&existing, &entry))
}

#[test]
fn test_entry_at() {
    use chrono::TimeZone;

    let when = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap();
    assert_eq!(
        entry_at(&when, "cd /work && webup-aws destroy"),
        "05 07 * * * cd /work && webup-aws destroy"
    );
}

#[test]
fn test_append_entry() {
    assert_eq!(append_entry("", "1 2 * * * x"), "1 2 * * * x\n");
    assert_eq!(
        append_entry("0 0 * * * existing\n", "1 2 * * * x"),
        "0 0 * * * existing\n1 2 * * * x\n"
    );

    // scheduling twice keeps both entries
    let once = append_entry("", "1 2 * * * x");
    let twice = append_entry(&once, "1 2 * * * x");
    assert_eq!(twice.matches("1 2 * * * x").count(), 2);
}
