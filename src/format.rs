use super::*;

/// qBittorrent reports this ETA (100 days) when it cannot estimate one.
pub(super) const ETA_UNKNOWN_SECS: u64 = 8_640_000;
const PROGRESS_BAR_CELLS: usize = 15;
const PROGRESS_BLOCKS: [&str; 9] = ["", "▏", "▎", "▍", "▌", "▋", "▊", "▉", "█"];
/// Telegram rejects message texts longer than this.
pub(super) const MAX_MESSAGE_CHARS: usize = 4096;
const ITEM_SEPARATOR: &str = "\n\n";
/// Room left for the "and N more" line.
const OVERFLOW_RESERVE_CHARS: usize = 128;
const BYTE_UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

pub(super) fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{} {}", round2(value), BYTE_UNITS[unit])
}

pub(super) fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

pub(super) fn format_percent(progress: f64) -> String {
    format!("{}%", round2(progress.clamp(0.0, 1.0) * 100.0))
}

/// Block bar with 1/8 cell resolution followed by the percentage.
pub(super) fn format_progress(progress: f64) -> String {
    let normalized = progress.clamp(0.0, 1.0);
    let scaled = normalized * PROGRESS_BAR_CELLS as f64;
    let full = scaled.floor() as usize;
    let partial = ((scaled - full as f64) * 8.0).round() as usize;
    let tail = PROGRESS_BLOCKS[partial.min(8)];

    let mut bar = "█".repeat(full);
    bar.push_str(tail);
    let used = full + usize::from(!tail.is_empty());
    bar.push_str(&" ".repeat(PROGRESS_BAR_CELLS.saturating_sub(used)));
    format!("▏{}▕ {}", bar, format_percent(normalized))
}

/// The two most significant units, e.g. `1h 5m` or `42s`.
pub(super) fn format_duration(
    seconds: u64,
    translator: &dyn Translator,
    locale: &str,
) -> String {
    let parts = [
        (seconds / 86_400, "unit-day"),
        ((seconds % 86_400) / 3_600, "unit-hour"),
        ((seconds % 3_600) / 60, "unit-minute"),
        (seconds % 60, "unit-second"),
    ];
    let rendered: Vec<String> = parts
        .iter()
        .skip_while(|(value, _)| *value == 0)
        .take(2)
        .filter(|(value, _)| *value > 0)
        .map(|(value, key)| format!("{}{}", value, translator.translate(key, locale, &[])))
        .collect();
    if rendered.is_empty() {
        return format!("0{}", translator.translate("unit-second", locale, &[]));
    }
    rendered.join(" ")
}

pub(super) fn format_eta(seconds: u64, translator: &dyn Translator, locale: &str) -> String {
    if seconds >= ETA_UNKNOWN_SECS {
        "∞".to_string()
    } else {
        format_duration(seconds, translator, locale)
    }
}

/// Escapes text for Telegram's HTML parse mode.
pub(super) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub(super) fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

pub(super) fn remove_command(uid: &str) -> String {
    format!("/rm_{}", uid)
}

pub(super) fn files_command(uid: &str) -> String {
    format!("/ls_{}", uid)
}

pub(super) fn download_command(engine: &str, id: &str) -> String {
    format!("/dl_{}_{}", engine, id)
}

pub(super) fn render_pending_item(
    translator: &dyn Translator,
    locale: &str,
    uid: &str,
    status: &TorrentStatus,
) -> String {
    translator.translate(
        "progress-item",
        locale,
        &[
            ("title", escape_html(&status.name)),
            ("bar", format_progress(status.progress)),
            ("seeds", status.seeds.to_string()),
            ("max_seeds", status.max_seeds.to_string()),
            ("peers", status.peers.to_string()),
            ("max_peers", status.max_peers.to_string()),
            ("speed", format_speed(status.download_speed)),
            ("eta", format_eta(status.eta_seconds, translator, locale)),
            ("remove", remove_command(uid)),
        ],
    )
}

pub(super) fn render_completed_item(
    translator: &dyn Translator,
    locale: &str,
    uid: &str,
    status: &TorrentStatus,
) -> String {
    translator.translate(
        "completed-item",
        locale,
        &[
            ("title", escape_html(&status.name)),
            ("size", format_bytes(status.size_bytes)),
            ("remove", remove_command(uid)),
        ],
    )
}

/// Joins the pending items into one message body. Items that would push the
/// text past Telegram's limit are summarized in a trailing line.
pub(super) fn render_progress_body(
    translator: &dyn Translator,
    locale: &str,
    pending: &[(String, TorrentStatus)],
) -> String {
    let items = pending
        .iter()
        .map(|(uid, status)| render_pending_item(translator, locale, uid, status));
    join_within_limit(String::new(), items, pending.len(), |hidden| {
        translator.translate("items-more", locale, &[("count", hidden.to_string())])
    })
}

pub(super) fn render_file_list(
    translator: &dyn Translator,
    locale: &str,
    files: &[TorrentFile],
) -> String {
    let title = translator.translate("files-title", locale, &[("count", files.len().to_string())]);
    let items = files.iter().map(|file| {
        translator.translate(
            "files-item",
            locale,
            &[
                ("name", escape_html(&file.name)),
                ("size", format_bytes(file.size)),
                ("progress", format_percent(file.progress)),
            ],
        )
    });
    join_within_limit(title, items, files.len(), |hidden| {
        translator.translate("items-more", locale, &[("count", hidden.to_string())])
    })
}

/// Appends `items` to `head` until the next one would not fit in a message,
/// then appends `overflow(hidden)` instead.
fn join_within_limit(
    head: String,
    items: impl Iterator<Item = String>,
    total: usize,
    overflow: impl Fn(usize) -> String,
) -> String {
    let budget = MAX_MESSAGE_CHARS - OVERFLOW_RESERVE_CHARS;
    let mut used = head.chars().count();
    let mut body = head;
    for (shown, item) in items.enumerate() {
        let separator = if body.is_empty() { "" } else { ITEM_SEPARATOR };
        let cost = separator.chars().count() + item.chars().count();
        if used + cost > budget {
            body.push_str(separator);
            body.push_str(&overflow(total - shown));
            return body;
        }
        body.push_str(separator);
        body.push_str(&item);
        used += cost;
    }
    body
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
