mod config;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::PhotoSize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

use config::Config;
use relay::commands::Route;
use relay::{
    GENERIC_FAILURE, GeminiClient, Incoming, ModelCatalog, ModelGateway, Reply, Router,
    SessionStore, TelegramClient, fallback_models,
};

const PHOTO_FAILURE: &str = "⚠️ Couldn't download the image. Please try again.";

struct BotState {
    router: Router,
    telegram: TelegramClient,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gemini-relay: {e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("gemini-relay.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("gemini-relay: failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting gemini-relay...");
    if let Some(path) = &config_path {
        info!("Loaded config from {}", path.display());
    }
    info!("Default model: {}", config.default_model);

    let bot = Bot::new(&config.telegram_token);

    let bot_username = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            me.username().to_string()
        }
        Err(e) => {
            warn!("Failed to get bot info: {e}");
            String::new()
        }
    };

    let gateway: Arc<dyn ModelGateway> = match GeminiClient::new(
        config.gemini_api_key.clone(),
        &config.gemini_base_url,
        config.request_timeout,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create Gemini client: {e}");
            std::process::exit(1);
        }
    };

    let seed = config.models.clone().unwrap_or_else(fallback_models);
    let catalog = Arc::new(ModelCatalog::new(seed, &config.default_model));

    if config.discover_models() {
        let catalog = catalog.clone();
        let gateway = gateway.clone();
        let ttl = config.model_cache_ttl;
        tokio::spawn(async move {
            // First tick fires immediately.
            let mut interval = tokio::time::interval(ttl);
            loop {
                interval.tick().await;
                if let Err(e) = catalog.refresh(gateway.as_ref()).await {
                    warn!("Model list refresh failed, keeping {} models: {e}", catalog.len());
                }
            }
        });
    } else {
        info!("Using {} pinned models", catalog.len());
    }

    let sessions = Arc::new(SessionStore::new(config.default_model.clone(), catalog.clone()));
    let router = Router::new(sessions, catalog, gateway, bot_username);

    let telegram = TelegramClient::new(bot.clone());
    if let Err(e) = telegram.register_commands().await {
        warn!("{e}");
    }

    let state = Arc::new(BotState { router, telegram });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd);
        })
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/// Run `fut` on its own task. Returns true if it panicked.
async fn panicked<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Err(e) if e.is_panic() => {
            error!("💥 Handler panicked: {}", e);
            true
        }
        _ => false,
    }
}

async fn handle_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    if panicked(process_message(msg, state.clone())).await {
        state
            .telegram
            .send_reply(chat_id, &Reply::plain(GENERIC_FAILURE))
            .await
            .ok();
    }
    Ok(())
}

async fn process_message(msg: Message, state: Arc<BotState>) {
    let Some(user) = msg.from.as_ref() else {
        return;
    };
    let chat_id = msg.chat.id.0;
    let username = user.username.as_deref().unwrap_or(&user.first_name).to_string();
    let text = msg.text().or(msg.caption()).map(str::to_string);
    let photo = msg.photo().and_then(largest_photo);

    let route = relay::commands::classify(text.as_deref(), photo.is_some(), state.router.bot_username());
    if route == Route::Ignore {
        return;
    }

    let _typing = matches!(route, Route::Chat).then(|| state.telegram.start_typing(chat_id));

    let image = match photo {
        Some(photo) => match state.telegram.download_photo(photo.file.id.clone()).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Chat {}: {}", chat_id, e);
                state
                    .telegram
                    .send_reply(chat_id, &Reply::plain(PHOTO_FAILURE))
                    .await
                    .ok();
                return;
            }
        },
        None => None,
    };

    let incoming = Incoming {
        chat_id,
        user_id: user.id.0 as i64,
        username,
        text,
        image,
    };

    if let Some(reply) = state.router.dispatch(route, incoming).await {
        state.telegram.send_reply(chat_id, &reply).await.ok();
    }
}

/// Telegram sends several sizes of each photo; take the biggest.
fn largest_photo(sizes: &[PhotoSize]) -> Option<&PhotoSize> {
    sizes.iter().max_by_key(|p| p.width * p.height)
}

async fn handle_callback(bot: Bot, query: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    bot.answer_callback_query(query.id.clone()).await.ok();

    let chat_id = query.message.as_ref().map(|m| m.chat().id.0);
    if panicked(process_callback(query, state.clone())).await
        && let Some(chat_id) = chat_id
    {
        state
            .telegram
            .send_reply(chat_id, &Reply::plain(GENERIC_FAILURE))
            .await
            .ok();
    }
    Ok(())
}

async fn process_callback(query: CallbackQuery, state: Arc<BotState>) {
    let (Some(data), Some(message)) = (&query.data, &query.message) else {
        return;
    };

    let chat_id = message.chat().id;
    info!("🔘 Callback \"{}\" in chat {}", data, chat_id);

    if let Some(reply) = state.router.handle_callback(chat_id.0, data).await {
        state.telegram.edit_reply(chat_id, message.id(), &reply).await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicked_reports_panic() {
        assert!(panicked(async { panic!("handler blew up"); }).await);
    }

    #[tokio::test]
    async fn test_panicked_false_on_normal_completion() {
        assert!(!panicked(async {}).await);
    }
}
