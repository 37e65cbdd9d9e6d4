//! Box-drawn connection banner, printed to stderr whenever the manager
//! announces the current status.

use chrono::{DateTime, Utc};

/// Prints the same box-drawn status block as `PrintConnectionInfo`, word
/// wrapped at 80 columns.
pub fn print_connection_info(endpoint: Option<&str>, expiration: DateTime<Utc>) {
    let Some(endpoint) = endpoint else {
        return;
    };

    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return;
    };

    let message = format!(
        "Breakpoint! Running until {} ({}).",
        expiration.format("%b %e %H:%M:%S %Z"),
        relative(expiration)
    );

    let lines = wrap(&message, 80);
    let longest = lines.iter().map(|l| l.len()).max().unwrap_or(0);
    let rule = "─".repeat(longest);

    eprintln!();
    eprintln!("┌─{rule}─┐");
    for line in &lines {
        eprintln!("│ {line}{} │", " ".repeat(longest - line.len()));
    }
    eprintln!("└─{rule}─┘");
    eprintln!();

    eprintln!("Connect with:\n");
    eprintln!("ssh -p {port} runner@{host}");
}

fn relative(target: DateTime<Utc>) -> String {
    let delta = target - Utc::now();
    if delta.num_seconds() <= 0 {
        "now".to_string()
    } else {
        format!("in {}", humantime::format_duration(delta.to_std().unwrap_or_default()))
    }
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_respects_width() {
        let lines = wrap("a b c d e f g h i j k l m n o p q r s t u v w x y z", 10);
        assert!(lines.iter().all(|l| l.len() <= 10));
    }
}
