mod values;

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use messaging_provider_weixin::error::PAYLOAD_TOO_LARGE;
use messaging_provider_weixin::signature::handshake_signature;
use messaging_provider_weixin::{
    BODY_LIMIT, Envelope, MessageCipher, NormalizedMessage, ReplySpec, WebhookQuery,
    WebhookRequest, WebhookResponse, WeixinApplication, WeixinConfig, WeixinError, WeixinWebhook,
    WxBizMsgCrypt,
};
use rand::Rng;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::values::{Values, load_reply};

#[derive(Parser)]
#[command(name = "weixin-messaging-tester")]
#[command(about = "Local driver for the Weixin webhook provider", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the webhook locally, replying with a fixed reply or an echo.
    Listen {
        #[arg(long, value_name = "VALUES_JSON")]
        values: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, default_value = "/")]
        path: String,
        #[arg(long, value_name = "REPLY_JSON")]
        reply: Option<PathBuf>,
    },
    /// Print a signed callback query (and envelope body when encrypting).
    Query {
        #[arg(long, value_name = "VALUES_JSON")]
        values: PathBuf,
        #[arg(long, value_name = "XML_FILE")]
        xml: Option<PathBuf>,
        #[arg(long, value_enum)]
        encrypt_type: Option<EncryptType>,
        #[arg(long)]
        echostr: Option<String>,
        #[arg(long)]
        timestamp: Option<i64>,
        #[arg(long)]
        nonce: Option<u64>,
    },
    /// Open an encrypted envelope and print the inner message.
    Decrypt {
        #[arg(long, value_name = "VALUES_JSON")]
        values: PathBuf,
        #[arg(long, value_name = "BODY_FILE")]
        body: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EncryptType {
    Aes,
    Raw,
}

impl EncryptType {
    fn as_str(self) -> &'static str {
        match self {
            EncryptType::Aes => "aes",
            EncryptType::Raw => "raw",
        }
    }
}

struct QueryParams {
    values_path: PathBuf,
    xml: Option<PathBuf>,
    encrypt_type: Option<EncryptType>,
    echostr: Option<String>,
    timestamp: Option<i64>,
    nonce: Option<u64>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    };
    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Listen {
            values,
            host,
            port,
            path,
            reply,
        } => handle_listen(values, host, port, path, reply),
        Command::Query {
            values,
            xml,
            encrypt_type,
            echostr,
            timestamp,
            nonce,
        } => handle_query(QueryParams {
            values_path: values,
            xml,
            encrypt_type,
            echostr,
            timestamp,
            nonce,
        }),
        Command::Decrypt { values, body } => handle_decrypt(values, body),
    }
}

fn load_config(values_path: &Path) -> Result<WeixinConfig, CliError> {
    Values::load(values_path)
        .and_then(|values| values.weixin_config())
        .map_err(|err| CliError::ValuesLoad(values_path.to_path_buf(), err))
}

fn require_cipher(config: &WeixinConfig) -> Result<WxBizMsgCrypt, CliError> {
    config.build_cipher()?.ok_or(CliError::Webhook(WeixinError::CipherUnavailable))
}

fn read_input(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|err| CliError::Input(path.to_path_buf(), err.into()))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.into()))?;
    println!("{rendered}");
    std::io::stdout().flush().ok();
    Ok(())
}

fn handle_query(params: QueryParams) -> Result<(), CliError> {
    let QueryParams {
        values_path,
        xml,
        encrypt_type,
        echostr,
        timestamp,
        nonce,
    } = params;
    let config = load_config(&values_path)?;
    config.validate()?;
    let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp());
    let nonce = nonce.unwrap_or_else(|| rand::thread_rng().gen_range(0..10_000_000_000));
    let xml = xml.as_deref().map(read_input).transpose()?;

    let mut query = WebhookQuery::default();
    query.insert("timestamp", timestamp.to_string());
    query.insert("nonce", nonce.to_string());
    query.insert(
        "signature",
        handshake_signature(&config.token, &timestamp.to_string(), &nonce.to_string()),
    );
    if let Some(echostr) = echostr {
        query.insert("echostr", echostr);
    }
    if let Some(encrypt_type) = encrypt_type {
        query.insert("encrypt_type", encrypt_type.as_str());
    }

    let body = match (encrypt_type, xml) {
        (Some(EncryptType::Aes), Some(xml)) => {
            let cipher = require_cipher(&config)?;
            let envelope = Envelope::seal_with(&cipher, &xml, timestamp, nonce)?;
            query.insert("msg_signature", envelope.signature.clone());
            Some(envelope.render()?)
        }
        (Some(EncryptType::Aes), None) => {
            return Err(CliError::Usage(
                "--encrypt-type aes requires --xml to build the envelope".into(),
            ));
        }
        (_, xml) => xml,
    };

    print_json(&json!({
        "query": query.to_query_string(),
        "body": body,
    }))
}

fn handle_decrypt(values_path: PathBuf, body_path: PathBuf) -> Result<(), CliError> {
    let config = load_config(&values_path)?;
    let cipher = require_cipher(&config)?;
    let body = read_input(&body_path)?;
    let outer = NormalizedMessage::parse(body.as_bytes())?;
    let encrypted = outer
        .encrypt()
        .ok_or_else(|| CliError::Usage(format!("{} has no Encrypt element", body_path.display())))?;
    let decrypted = cipher.decrypt(encrypted).map_err(WeixinError::from)?;
    if decrypted.message.is_empty() {
        return Err(CliError::Webhook(WeixinError::InvalidSignature));
    }
    let message = NormalizedMessage::parse(decrypted.message.as_bytes())?;
    print_json(&json!({
        "app_id": decrypted.app_id,
        "message": message,
    }))
}

fn handle_listen(
    values_path: PathBuf,
    host: String,
    port: u16,
    path: String,
    reply: Option<PathBuf>,
) -> Result<(), CliError> {
    let config = load_config(&values_path)?;
    let webhook = WeixinWebhook::new(config)?;
    let reply = reply
        .map(|path| load_reply(&path).map_err(|err| CliError::Input(path.clone(), err)))
        .transpose()?;
    let state = ListenerState {
        expected_path: path.clone(),
        webhook,
        app: Arc::new(TesterApp { reply }),
    };

    let bind_addr = format!("{host}:{port}");
    info!(%bind_addr, %path, "weixin webhook listening");
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Listen(err.to_string()))?;
    runtime.block_on(async move {
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|err| CliError::Listen(err.to_string()))?;
        let app = Router::new()
            .fallback(handle_listener_request)
            .with_state(state);
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_shutdown())
            .await
            .map_err(|err| CliError::Listen(err.to_string()))
    })
}

#[derive(Clone)]
struct ListenerState {
    expected_path: String,
    webhook: WeixinWebhook,
    app: Arc<TesterApp>,
}

/// Replies with the configured reply value, or echoes the inbound text.
struct TesterApp {
    reply: Option<Value>,
}

#[async_trait]
impl WeixinApplication for TesterApp {
    async fn reply(&self, message: &NormalizedMessage) -> Result<ReplySpec, WeixinError> {
        if let Ok(inbound) = serde_json::to_string_pretty(message) {
            println!("{inbound}");
            std::io::stdout().flush().ok();
        }
        Ok(match &self.reply {
            Some(value) => ReplySpec::from_value(value),
            None => ReplySpec::text(message.content().unwrap_or_default()),
        })
    }
}

async fn handle_listener_request(state: State<ListenerState>, req: Request<Body>) -> Response {
    let uri = req.uri().clone();
    if uri.path() != state.expected_path {
        warn!(path = uri.path(), "request outside the webhook path");
        return StatusCode::NOT_FOUND.into_response();
    }
    let method = req.method().clone();
    let query = WebhookQuery::parse(uri.query().unwrap_or_default());
    let body = match to_bytes(req.into_body(), BODY_LIMIT).await {
        Ok(body) => body,
        Err(_) => {
            return into_axum(WebhookResponse::text(
                StatusCode::PAYLOAD_TOO_LARGE,
                PAYLOAD_TOO_LARGE,
            ));
        }
    };

    let request = WebhookRequest::new(method, query, body.to_vec());
    let response = state.webhook.respond(&request, &state.app).await;
    info!(method = %request.method, status = %response.status, "weixin webhook handled");
    into_axum(response)
}

fn into_axum(response: WebhookResponse) -> Response {
    let mut builder = http::Response::builder().status(response.status);
    if let Some(content_type) = response.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn wait_for_shutdown() {
    signal::ctrl_c().await.ok();
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("values load failed ({0}): {1}")]
    ValuesLoad(PathBuf, #[source] anyhow::Error),
    #[error("input load failed ({0}): {1}")]
    Input(PathBuf, #[source] anyhow::Error),
    #[error("failed to write output: {0}")]
    Output(#[source] anyhow::Error),
    #[error("{0}")]
    Usage(String),
    #[error("webhook failure: {0}")]
    Webhook(#[from] WeixinError),
    #[error("listen helper failure: {0}")]
    Listen(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::ValuesLoad(_, _) => 1,
            CliError::Input(_, _) => 1,
            CliError::Usage(_) => 2,
            CliError::Webhook(WeixinError::Config(_)) => 2,
            CliError::Webhook(WeixinError::InvalidSignature) => 3,
            CliError::Webhook(_) => 4,
            CliError::Output(_) => 6,
            CliError::Listen(_) => 7,
        }
    }
}
