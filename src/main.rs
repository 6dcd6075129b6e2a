use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use tutorbot::config::{Config, Provider};
use tutorbot::tutor::anthropic::AnthropicClient;
use tutorbot::tutor::groq::GroqClient;
use tutorbot::tutor::{
    Backends, CompletionBackend, ConversationStore, Sanitizer, StorageError, TelegramClient,
    TurnError, TutorEngine, TutorSettings,
};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Команды:")]
enum Command {
    #[command(description = "начать")]
    Start,
    #[command(description = "показать команды")]
    Help,
    #[command(description = "начать новый диалог")]
    Reset,
    #[command(description = "выбрать модель")]
    Model(String),
    #[command(description = "выбрать тему")]
    Topic(String),
    #[command(description = "мой прогресс")]
    Progress,
}

/// Everything a handler needs, passed through the dispatcher.
struct BotState {
    engine: TutorEngine,
    telegram: TelegramClient,
}

fn build_engine(config: &Config) -> Result<TutorEngine, StorageError> {
    let store = ConversationStore::open(&config.storage_dir)?;

    let http = reqwest::Client::builder()
        .timeout(config.model_timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!("Failed to build HTTP client with timeout: {e}");
            reqwest::Client::new()
        });

    let mut backends = Backends::new(&config.default_model);
    for model in &config.models {
        let backend: Arc<dyn CompletionBackend> = match model.provider {
            Provider::Groq => Arc::new(GroqClient::new(
                http.clone(),
                &config.groq_base_url,
                config.groq_api_key.clone().unwrap_or_default(),
                model.id.clone(),
            )),
            Provider::Anthropic => Arc::new(AnthropicClient::new(
                http.clone(),
                config.anthropic_api_key.clone().unwrap_or_default(),
                model.id.clone(),
            )),
        };
        backends.register(model.id.clone(), backend);
        info!("Model available: {} ({:?})", model.id, model.provider);
    }

    let sanitizer = Sanitizer::new(
        config.format_mode,
        config.emphasis_triggers.clone(),
        config.spoiler_triggers.clone(),
    );
    let settings = TutorSettings {
        system_prompt: config.system_prompt.clone(),
        context_messages: config.context_messages,
        model_timeout: config.model_timeout,
    };

    Ok(TutorEngine::new(store, sanitizer, backends, settings))
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tutorbot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("tutorbot.log"))
        .expect("Failed to open log file");
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

    info!("🚀 Starting tutorbot...");
    info!("Loaded config from {config_path}");
    info!(
        "Format mode: {:?}, default model: {}",
        config.format_mode, config.default_model
    );

    let engine = match build_engine(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to open conversation store: {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {e}");
    }

    let state = Arc::new(BotState {
        engine,
        telegram: TelegramClient::new(bot.clone()),
    });

    let handler = Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(dptree::endpoint(handle_text));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_command(msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0.to_string();
    let engine = &state.engine;

    let result = match cmd {
        Command::Start => engine
            .start(&user_id, Some(&user.first_name))
            .await
            .map(str::to_string),
        Command::Help => Ok(Command::descriptions().to_string()),
        Command::Reset => engine
            .reset(&user_id)
            .await
            .map(|()| "🔄 История очищена. Начинаем новый диалог!".to_string()),
        Command::Model(id) => {
            let id = id.trim();
            if id.is_empty() {
                engine.models_overview(&user_id).await
            } else {
                engine.select_model(&user_id, id).await.map(|selected| {
                    if selected {
                        format!("🤖 Модель переключена на {id}")
                    } else {
                        format!("Не знаю модель {id}. Список моделей: /model")
                    }
                })
            }
        }
        Command::Topic(topic) => {
            let topic = topic.trim();
            if topic.is_empty() {
                Ok("Укажи тему, например: /topic Рекурсия".to_string())
            } else {
                engine
                    .set_topic(&user_id, topic)
                    .await
                    .map(|()| format!("📚 Тема: {topic}"))
            }
        }
        Command::Progress => engine.progress(&user_id).await,
    };

    let text = match result {
        Ok(text) => text,
        Err(e) => {
            error!("Command failed for user {}: {}", user_id, e);
            TurnError::Storage(e).user_message().to_string()
        }
    };

    if let Err(e) = state.telegram.send_text(msg.chat.id, &text).await {
        warn!("Failed to answer command for user {}: {}", user_id, e);
    }
    Ok(())
}

async fn handle_text(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let (Some(user), Some(text)) = (msg.from.as_ref(), msg.text()) else {
        return Ok(());
    };
    let user_id = user.id.0.to_string();

    info!(
        "📨 {} ({}): \"{}\"",
        user.first_name,
        user_id,
        text.chars().take(50).collect::<String>()
    );

    state.telegram.typing(msg.chat.id).await;
    let reply = state.engine.handle_text(&user_id, text).await;

    if let Err(e) = state.telegram.send_rendered(msg.chat.id, &reply).await {
        error!("Failed to deliver reply to user {}: {}", user_id, e);
    }
    Ok(())
}
