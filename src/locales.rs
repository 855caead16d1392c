use super::*;

pub(super) const SUPPORTED_LOCALES: &[&str] = &["en", "ru"];

/// Resolves a message key for a locale and fills in `{param}` placeholders.
pub(super) trait Translator: Send + Sync {
    fn translate(&self, key: &str, locale: &str, params: &[(&str, String)]) -> String;
}

/// Built-in string tables. Unknown locales fall back to English, unknown
/// keys to the key itself.
pub(super) struct Locales;

impl Translator for Locales {
    fn translate(&self, key: &str, locale: &str, params: &[(&str, String)]) -> String {
        match lookup(locale, key).or_else(|| lookup(DEFAULT_LOCALE, key)) {
            Some(template) => render_template(template, params),
            None => key.to_string(),
        }
    }
}

pub(super) fn is_supported_locale(locale: &str) -> bool {
    SUPPORTED_LOCALES.contains(&locale)
}

fn lookup(locale: &str, key: &str) -> Option<&'static str> {
    let table = match locale {
        "en" => EN,
        "ru" => RU,
        _ => return None,
    };
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Substitutes `{name}` placeholders in one pass, so text coming from a
/// parameter is never scanned for further placeholders.
fn render_template(template: &str, params: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let name = after
            .find('}')
            .map(|close| &after[..close])
            .filter(|name| !name.contains('{'));
        match name {
            Some(name) => {
                match params.iter().find(|(key, _)| *key == name) {
                    Some((_, value)) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

const EN: &[(&str, &str)] = &[
    (
        "help",
        "Send me a magnet link (or /add followed by one) and I will download it and keep you posted. Any other text is searched for.\n\n/torrents - everything you added\n/lang - change the language",
    ),
    ("add-usage", "Send a magnet link: /add magnet:?xt=urn:btih:..."),
    ("add-success", "Torrent added. Progress will show up here shortly."),
    ("add-duplicate", "This torrent has already been added."),
    ("add-error", "Failed to add the torrent."),
    ("remove-success", "Torrent removed."),
    ("remove-error", "Failed to remove the torrent."),
    ("remove-not-found", "Torrent not found."),
    (
        "progress-item",
        "⬇️ <b>{title}</b>\n<code>{bar}</code>\nSeeds: {seeds} ({max_seeds}) · Peers: {peers} ({max_peers})\n{speed} · ETA {eta}\nRemove: {remove}",
    ),
    ("items-more", "…and {count} more"),
    ("completed-item", "✅ <b>{title}</b> is downloaded ({size})\nRemove: {remove}"),
    ("list-title", "<b>Torrents</b> ({page}/{total})"),
    ("list-empty", "Nothing here yet. Send a magnet link to add a torrent."),
    ("list-item-downloading", "⬇️ <b>{title}</b>\n{progress} · {speed} · ETA {eta}\nFiles: {files}"),
    ("list-item-completed", "✅ <b>{title}</b>\n{progress} · {size}\nFiles: {files}"),
    ("list-item-missing", "❔ <code>{uid}</code>\nNot known to the download daemon"),
    ("list-error", "Failed to load torrents."),
    (
        "search-item",
        "<b>{title}</b>\n{source} · {size} · Seeds: {seeds} · Peers: {peers} · {published}\nDownload: {download}",
    ),
    ("search-empty", "Nothing found."),
    ("search-error", "Search failed, try again later."),
    ("search-unsupported", "Search is not available. Send a magnet link instead."),
    ("download-unsupported", "Unknown search result. Search again and pick a /dl_ command."),
    ("files-title", "<b>Files</b> ({count})"),
    ("files-item", "{name}\n{size} · {progress}"),
    ("files-empty", "No files yet. The torrent metadata may still be downloading."),
    ("files-error", "Failed to load the file list."),
    ("btn-remove", "Remove {title}"),
    ("btn-prev", "« Prev"),
    ("btn-next", "Next »"),
    ("btn-refresh", "Refresh"),
    ("lang-current", "Current language: {locale}. Available: {available}"),
    ("lang-set", "Language set to English."),
    ("lang-unknown", "Unknown language {locale}. Available: {available}"),
    ("unit-day", "d"),
    ("unit-hour", "h"),
    ("unit-minute", "m"),
    ("unit-second", "s"),
];

const RU: &[(&str, &str)] = &[
    (
        "help",
        "Пришлите magnet-ссылку (или /add и ссылку), я скачаю торрент и буду сообщать о прогрессе. Любой другой текст я поищу.\n\n/torrents - все добавленные торренты\n/lang - сменить язык",
    ),
    ("add-usage", "Пришлите magnet-ссылку: /add magnet:?xt=urn:btih:..."),
    ("add-success", "Торрент добавлен. Прогресс скоро появится здесь."),
    ("add-duplicate", "Этот торрент уже добавлен."),
    ("add-error", "Не удалось добавить торрент."),
    ("remove-success", "Торрент удалён."),
    ("remove-error", "Не удалось удалить торрент."),
    ("remove-not-found", "Торрент не найден."),
    (
        "progress-item",
        "⬇️ <b>{title}</b>\n<code>{bar}</code>\nСиды: {seeds} ({max_seeds}) · Пиры: {peers} ({max_peers})\n{speed} · Осталось {eta}\nУдалить: {remove}",
    ),
    ("items-more", "…и ещё {count}"),
    ("completed-item", "✅ <b>{title}</b> скачан ({size})\nУдалить: {remove}"),
    ("list-title", "<b>Торренты</b> ({page}/{total})"),
    ("list-empty", "Здесь пока пусто. Пришлите magnet-ссылку, чтобы добавить торрент."),
    ("list-item-downloading", "⬇️ <b>{title}</b>\n{progress} · {speed} · осталось {eta}\nФайлы: {files}"),
    ("list-item-completed", "✅ <b>{title}</b>\n{progress} · {size}\nФайлы: {files}"),
    ("list-item-missing", "❔ <code>{uid}</code>\nНе найден в торрент-клиенте"),
    ("list-error", "Не удалось загрузить список торрентов."),
    (
        "search-item",
        "<b>{title}</b>\n{source} · {size} · Сиды: {seeds} · Пиры: {peers} · {published}\nСкачать: {download}",
    ),
    ("search-empty", "Ничего не найдено."),
    ("search-error", "Поиск не удался, попробуйте позже."),
    ("search-unsupported", "Поиск недоступен. Пришлите magnet-ссылку."),
    ("download-unsupported", "Неизвестный результат поиска. Повторите поиск и выберите команду /dl_."),
    ("files-title", "<b>Файлы</b> ({count})"),
    ("files-item", "{name}\n{size} · {progress}"),
    ("files-empty", "Файлов пока нет. Возможно, метаданные торрента ещё загружаются."),
    ("files-error", "Не удалось загрузить список файлов."),
    ("btn-remove", "Удалить {title}"),
    ("btn-prev", "« Назад"),
    ("btn-next", "Вперёд »"),
    ("btn-refresh", "Обновить"),
    ("lang-current", "Текущий язык: {locale}. Доступные: {available}"),
    ("lang-set", "Язык переключён на русский."),
    ("lang-unknown", "Неизвестный язык {locale}. Доступные: {available}"),
    ("unit-day", "д"),
    ("unit-hour", "ч"),
    ("unit-minute", "м"),
    ("unit-second", "с"),
];
