use super::*;
use teloxide::types::MessageId;
use teloxide::{ApiError, RequestError};

const LIST_PAGE_SIZE: usize = 5;
const BUTTON_TITLE_CHARS: usize = 24;
const LIST_CALLBACK_PREFIX: &str = "torrents:";

#[derive(Debug, PartialEq)]
pub(super) enum AddOutcome {
    Added,
    Duplicate,
    /// The `/dl_` command names no known engine or result.
    Unsupported,
}

#[derive(Debug, PartialEq)]
pub(super) enum RemoveOutcome {
    Removed,
    NotFound,
}

/// What a text message asks for.
#[derive(Debug, PartialEq)]
pub(super) enum Route<'a> {
    Help,
    Add(Option<MagnetLink>),
    List,
    Lang(Option<&'a str>),
    Remove(&'a str),
    Download(&'a str),
    Files(&'a str),
    Search(&'a str),
}

#[derive(Debug, PartialEq)]
pub(super) enum ListCallback {
    Page(usize),
    Refresh(usize),
    Remove { uid: String, page: usize },
}

pub(super) async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> Result<()> {
    let user_id = match msg.from() {
        Some(user) => user.id.0,
        None => return Ok(()),
    };
    if !state.is_allowed(user_id) {
        debug!("ignoring message from user {}", user_id);
        return Ok(());
    }
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let chat_id = msg.chat.id.0;
    let locale = state.locale(chat_id).await;

    match route_message(text) {
        Route::Help => {
            reply(&bot, msg.chat.id, state.t(&locale, "help", &[])).await?;
        }
        Route::Add(Some(magnet)) => {
            let source = TorrentSource::from_magnet(magnet);
            handle_add(&bot, &state, chat_id, &locale, &source).await?;
        }
        Route::Add(None) => {
            reply(&bot, msg.chat.id, state.t(&locale, "add-usage", &[])).await?;
        }
        Route::List => {
            let (body, keyboard) = build_torrent_list(&state, chat_id, 0, &locale).await;
            bot.send_message(msg.chat.id, body)
                .parse_mode(ParseMode::Html)
                .disable_web_page_preview(true)
                .reply_markup(keyboard)
                .await?;
        }
        Route::Lang(requested) => {
            handle_lang(&bot, &state, chat_id, &locale, requested).await?;
        }
        Route::Remove(uid) => handle_remove(&bot, &state, chat_id, &locale, uid).await?,
        Route::Download(target) => handle_download(&bot, &state, chat_id, &locale, target).await?,
        Route::Files(uid) => handle_files(&bot, &state, chat_id, &locale, uid).await?,
        Route::Search(query) => handle_search(&bot, &state, chat_id, &locale, query).await?,
    }

    Ok(())
}

pub(super) fn route_message(text: &str) -> Route<'_> {
    match parse_command(text) {
        Some("start") | Some("help") => Route::Help,
        Some("add") => Route::Add(MagnetLink::find_in(text)),
        Some("torrents") => Route::List,
        Some("lang") => Route::Lang(text.split_whitespace().nth(1)),
        Some(cmd) if cmd.starts_with("rm_") => Route::Remove(&cmd["rm_".len()..]),
        Some(cmd) if cmd.starts_with("dl_") => Route::Download(&cmd["dl_".len()..]),
        Some(cmd) if cmd.starts_with("ls_") => Route::Files(&cmd["ls_".len()..]),
        Some(_) => Route::Help,
        None => match MagnetLink::find_in(text) {
            Some(magnet) => Route::Add(Some(magnet)),
            None if text.trim().is_empty() => Route::Add(None),
            None => Route::Search(text.trim()),
        },
    }
}

pub(super) async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<AppState>) -> Result<()> {
    if !state.is_allowed(q.from.id.0) {
        return Ok(());
    }
    let Some(message) = q.message.clone() else {
        return Ok(());
    };
    let Some(action) = q.data.as_deref().and_then(parse_list_callback) else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };

    let chat_id = message.chat.id.0;
    let locale = state.locale(chat_id).await;
    let page = match action {
        ListCallback::Page(page) | ListCallback::Refresh(page) => {
            bot.answer_callback_query(q.id).await?;
            page
        }
        ListCallback::Remove { uid, page } => {
            let notice = match remove_torrent(&state, chat_id, &uid).await {
                Ok(RemoveOutcome::Removed) => state.t(&locale, "remove-success", &[]),
                Ok(RemoveOutcome::NotFound) => state.t(&locale, "remove-not-found", &[]),
                Err(err) => {
                    error!("remove {} from chat {} failed: {:#}", uid, chat_id, err);
                    state.t(&locale, "remove-error", &[])
                }
            };
            bot.answer_callback_query(q.id).text(notice).await?;
            state.engine.reconcile(chat_id, true).await;
            page
        }
    };

    let (body, keyboard) = build_torrent_list(&state, chat_id, page, &locale).await;
    edit_list_message(&bot, message.chat.id, message.id, body, keyboard).await
}

async fn handle_add(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: i64,
    locale: &str,
    source: &TorrentSource,
) -> Result<()> {
    let outcome = add_torrent(state, chat_id, source).await;
    announce_add(bot, state, chat_id, locale, &source.uid(), outcome).await
}

async fn handle_download(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: i64,
    locale: &str,
    target: &str,
) -> Result<()> {
    let outcome = download_from_search(state, chat_id, target).await;
    announce_add(bot, state, chat_id, locale, target, outcome).await
}

async fn announce_add(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: i64,
    locale: &str,
    uid: &str,
    outcome: Result<AddOutcome>,
) -> Result<()> {
    let key = match outcome {
        Ok(AddOutcome::Added) => {
            info!("chat {} added torrent {}", chat_id, uid);
            "add-success"
        }
        Ok(AddOutcome::Duplicate) => "add-duplicate",
        Ok(AddOutcome::Unsupported) => "download-unsupported",
        Err(err) => {
            error!("adding torrent {} failed: {:#}", uid, err);
            "add-error"
        }
    };
    reply(bot, ChatId(chat_id), state.t(locale, key, &[])).await?;
    if key == "add-success" {
        state.engine.reconcile(chat_id, true).await;
    }
    Ok(())
}

async fn handle_search(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: i64,
    locale: &str,
    query: &str,
) -> Result<()> {
    let text = if state.search_engines.is_empty() {
        state.t(locale, "search-unsupported", &[])
    } else {
        match search_all(&state.search_engines, query).await {
            Ok(hits) if hits.is_empty() => state.t(locale, "search-empty", &[]),
            Ok(hits) => render_search_results(state.translator.as_ref(), locale, &hits),
            Err(err) => {
                error!("search {:?} in chat {} failed: {:#}", query, chat_id, err);
                state.t(locale, "search-error", &[])
            }
        }
    };
    reply(bot, ChatId(chat_id), text).await
}

async fn handle_files(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: i64,
    locale: &str,
    uid: &str,
) -> Result<()> {
    let text = match torrent_files(state, chat_id, uid).await {
        Ok(None) => state.t(locale, "remove-not-found", &[]),
        Ok(Some(files)) if files.is_empty() => state.t(locale, "files-empty", &[]),
        Ok(Some(files)) => render_file_list(state.translator.as_ref(), locale, &files),
        Err(err) => {
            error!("listing files of {} failed: {:#}", uid, err);
            state.t(locale, "files-error", &[])
        }
    };
    reply(bot, ChatId(chat_id), text).await
}

async fn handle_remove(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: i64,
    locale: &str,
    uid: &str,
) -> Result<()> {
    let key = match remove_torrent(state, chat_id, uid).await {
        Ok(RemoveOutcome::Removed) => "remove-success",
        Ok(RemoveOutcome::NotFound) => "remove-not-found",
        Err(err) => {
            error!("remove {} from chat {} failed: {:#}", uid, chat_id, err);
            "remove-error"
        }
    };
    reply(bot, ChatId(chat_id), state.t(locale, key, &[])).await?;
    if key == "remove-success" {
        state.engine.reconcile(chat_id, true).await;
    }
    Ok(())
}

async fn handle_lang(
    bot: &Bot,
    state: &AppState,
    chat_id: i64,
    locale: &str,
    requested: Option<&str>,
) -> Result<()> {
    let available = SUPPORTED_LOCALES.join(", ");
    let text = match requested.map(|code| code.to_ascii_lowercase()) {
        None => state.t(
            locale,
            "lang-current",
            &[("locale", locale.to_string()), ("available", available)],
        ),
        Some(code) if is_supported_locale(&code) => {
            state.settings.set_locale(chat_id, &code).await?;
            state.t(&code, "lang-set", &[])
        }
        Some(code) => state.t(
            locale,
            "lang-unknown",
            &[("locale", escape_html(&code)), ("available", available)],
        ),
    };
    reply(bot, ChatId(chat_id), text).await
}

/// Hands the magnet to the daemon, records its metadata and starts tracking it.
pub(super) async fn add_torrent(
    state: &AppState,
    chat_id: i64,
    source: &TorrentSource,
) -> Result<AddOutcome> {
    let uid = source.uid();
    let hash = &source.magnet.hash;
    if state.metas.get_by_uid(&uid).await.is_some() || state.metas.get_by_hash(hash).await.is_some()
    {
        return Ok(AddOutcome::Duplicate);
    }

    state
        .daemon
        .add_magnet(&source.magnet.uri)
        .await
        .context("add torrent to daemon")?;
    if let Err(err) = state.metas.create(source.to_meta(chat_id)).await {
        if let Err(rollback_err) = state.daemon.remove(hash).await {
            warn!("failed to roll back daemon add of {}: {:#}", hash, rollback_err);
        }
        return Err(err);
    }

    state.engine.track(chat_id, &uid).await;
    Ok(AddOutcome::Added)
}

/// Adds the result named by a `/dl_<engine>_<id>` command.
pub(super) async fn download_from_search(
    state: &AppState,
    chat_id: i64,
    target: &str,
) -> Result<AddOutcome> {
    let Some((name, id)) = target.split_once('_').filter(|(_, id)| !id.is_empty()) else {
        return Ok(AddOutcome::Unsupported);
    };
    let Some(engine) = state.search_engines.iter().find(|e| e.name() == name) else {
        return Ok(AddOutcome::Unsupported);
    };

    let uri = engine
        .download(id)
        .await
        .with_context(|| format!("fetch {} result {}", name, id))?;
    let magnet = MagnetLink::parse(&uri)
        .ok_or_else(|| anyhow!("{} returned an unusable magnet for {}", name, id))?;
    add_torrent(state, chat_id, &TorrentSource::from_search(name, id, magnet)).await
}

/// Files of a torrent owned by `chat_id`, `None` when the chat has no such torrent.
pub(super) async fn torrent_files(
    state: &AppState,
    chat_id: i64,
    uid: &str,
) -> Result<Option<Vec<TorrentFile>>> {
    let Some(meta) = state
        .metas
        .get_by_uid(uid)
        .await
        .filter(|meta| meta.chat_id == chat_id)
    else {
        return Ok(None);
    };
    let files = state
        .daemon
        .files(&meta.hash)
        .await
        .with_context(|| format!("list files of {}", meta.hash))?;
    Ok(Some(files))
}

/// Removes a torrent owned by `chat_id` from the daemon and the metadata store.
pub(super) async fn remove_torrent(
    state: &AppState,
    chat_id: i64,
    uid: &str,
) -> Result<RemoveOutcome> {
    let Some(meta) = state
        .metas
        .get_by_uid(uid)
        .await
        .filter(|meta| meta.chat_id == chat_id)
    else {
        return Ok(RemoveOutcome::NotFound);
    };

    state
        .daemon
        .remove(&meta.hash)
        .await
        .with_context(|| format!("remove {} from daemon", meta.hash))?;
    state.metas.remove_by_uid(uid).await?;
    state.engine.untrack(chat_id, uid).await;
    info!("chat {} removed torrent {}", chat_id, uid);
    Ok(RemoveOutcome::Removed)
}

pub(super) fn parse_list_callback(data: &str) -> Option<ListCallback> {
    let rest = data.strip_prefix(LIST_CALLBACK_PREFIX)?;
    let mut parts = rest.split(':');
    let action = match parts.next()? {
        "page" => ListCallback::Page(parts.next()?.parse().ok()?),
        "refresh" => ListCallback::Refresh(parts.next()?.parse().ok()?),
        "remove" => {
            let uid = parts.next().filter(|uid| !uid.is_empty())?.to_string();
            let page = parts.next()?.parse().ok()?;
            ListCallback::Remove { uid, page }
        }
        _ => return None,
    };
    parts.next().is_none().then_some(action)
}

fn list_callback_data(action: &ListCallback) -> String {
    match action {
        ListCallback::Page(page) => format!("{}page:{}", LIST_CALLBACK_PREFIX, page),
        ListCallback::Refresh(page) => format!("{}refresh:{}", LIST_CALLBACK_PREFIX, page),
        ListCallback::Remove { uid, page } => {
            format!("{}remove:{}:{}", LIST_CALLBACK_PREFIX, uid, page)
        }
    }
}

/// Renders one page of every torrent the chat has added, newest last.
pub(super) async fn build_torrent_list(
    state: &AppState,
    chat_id: i64,
    page: usize,
    locale: &str,
) -> (String, InlineKeyboardMarkup) {
    let metas = state.metas.list_by_chat_id(chat_id).await;
    if metas.is_empty() {
        return (
            state.t(locale, "list-empty", &[]),
            InlineKeyboardMarkup::new(Vec::<Vec<InlineKeyboardButton>>::new()),
        );
    }

    let total_pages = (metas.len() + LIST_PAGE_SIZE - 1) / LIST_PAGE_SIZE;
    let page = page.min(total_pages - 1);
    let page_items = &metas[page * LIST_PAGE_SIZE..((page + 1) * LIST_PAGE_SIZE).min(metas.len())];

    let hashes: Vec<String> = page_items.iter().map(|meta| meta.hash.clone()).collect();
    let statuses = match state.daemon.statuses(&hashes).await {
        Ok(statuses) => statuses,
        Err(err) => {
            warn!("torrent list for chat {} failed: {:#}", chat_id, err);
            let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
                state.t(locale, "btn-refresh", &[]),
                list_callback_data(&ListCallback::Refresh(page)),
            )]]);
            return (state.t(locale, "list-error", &[]), keyboard);
        }
    };

    let translator = state.translator.as_ref();
    let mut lines = vec![state.t(
        locale,
        "list-title",
        &[
            ("page", (page + 1).to_string()),
            ("total", total_pages.to_string()),
        ],
    )];
    let mut rows = Vec::new();
    for meta in page_items {
        let status = statuses.iter().find(|status| status.hash == meta.hash);
        let (line, title) = match status {
            Some(status) if status.is_complete() => (
                state.t(
                    locale,
                    "list-item-completed",
                    &[
                        ("title", escape_html(&status.name)),
                        ("progress", format_percent(status.progress)),
                        ("size", format_bytes(status.size_bytes)),
                        ("files", files_command(&meta.uid)),
                    ],
                ),
                status.name.clone(),
            ),
            Some(status) => (
                state.t(
                    locale,
                    "list-item-downloading",
                    &[
                        ("title", escape_html(&status.name)),
                        ("progress", format_percent(status.progress)),
                        ("speed", format_speed(status.download_speed)),
                        ("eta", format_eta(status.eta_seconds, translator, locale)),
                        ("files", files_command(&meta.uid)),
                    ],
                ),
                status.name.clone(),
            ),
            None => (
                state.t(locale, "list-item-missing", &[("uid", meta.uid.clone())]),
                meta.uid.clone(),
            ),
        };
        lines.push(line);
        rows.push(vec![InlineKeyboardButton::callback(
            state.t(
                locale,
                "btn-remove",
                &[("title", truncate_chars(&title, BUTTON_TITLE_CHARS))],
            ),
            list_callback_data(&ListCallback::Remove {
                uid: meta.uid.clone(),
                page,
            }),
        )]);
    }

    let mut nav = Vec::new();
    if page > 0 {
        nav.push(InlineKeyboardButton::callback(
            state.t(locale, "btn-prev", &[]),
            list_callback_data(&ListCallback::Page(page - 1)),
        ));
    }
    nav.push(InlineKeyboardButton::callback(
        state.t(locale, "btn-refresh", &[]),
        list_callback_data(&ListCallback::Refresh(page)),
    ));
    if page + 1 < total_pages {
        nav.push(InlineKeyboardButton::callback(
            state.t(locale, "btn-next", &[]),
            list_callback_data(&ListCallback::Page(page + 1)),
        ));
    }
    rows.push(nav);

    (lines.join("\n\n"), InlineKeyboardMarkup::new(rows))
}

async fn edit_list_message(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    body: String,
    keyboard: InlineKeyboardMarkup,
) -> Result<()> {
    let result = bot
        .edit_message_text(chat_id, message_id, body)
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true)
        .reply_markup(keyboard)
        .await;
    match result {
        Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn reply(bot: &Bot, chat_id: ChatId, text: String) -> Result<()> {
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true)
        .await?;
    Ok(())
}
