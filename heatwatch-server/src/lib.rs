use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::app::{AppContext, create_app};
use crate::configs::{SchemaManager, Settings, Storage};
use crate::repositories::DeviceRepository;
use crate::services::jobs::{
    ConsistencyJob, DailyReportJob, KeepaliveJob, SnapshotJob, spawn_job,
};
use crate::services::{
    BotCommands, MqttService, NotificationDispatcher, Shutdown, TelegramBot, shutdown,
    sink_from_settings,
};

pub mod app;
pub mod configs;
pub mod errors;
pub mod handles;
pub mod models;
pub mod repositories;
pub mod services;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Starts every scheduled job configured in `settings`.
pub fn spawn_jobs(context: &AppContext, shutdown: &Shutdown) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let schedule = &context.settings.schedule;
    let mut handles = Vec::new();

    handles.push(spawn_job(
        SnapshotJob::new(
            context.router.clone(),
            context.store.clone(),
            context.persistence.clone(),
            schedule.snapshot_interval(),
        ),
        shutdown.clone(),
    ));

    handles.push(spawn_job(
        ConsistencyJob::new(
            context.router.clone(),
            context.persistence.clone(),
            context.dispatcher.clone(),
            schedule.consistency_window(),
            schedule.consistency_interval(),
        ),
        shutdown.clone(),
    ));

    if let Some(url) = &schedule.keepalive_url {
        handles.push(spawn_job(
            KeepaliveJob::new(url, schedule.keepalive_interval())?,
            shutdown.clone(),
        ));
    }

    match &schedule.report_dir {
        Some(report_dir) => handles.push(spawn_job(
            DailyReportJob::new(
                context.router.clone(),
                context.persistence.clone(),
                context.dispatcher.clone(),
                report_dir,
                context.local_offset,
            ),
            shutdown.clone(),
        )),
        None => tracing::info!("report_dir is not set, daily reports are disabled"),
    }

    Ok(handles)
}

/// Starts the chat command loop when a bot is configured and commands are enabled.
pub fn spawn_bot(context: &AppContext, shutdown: &Shutdown) -> anyhow::Result<Option<JoinHandle<()>>> {
    let notification = &context.settings.notification;
    let (Some(token), Some(chat_id)) = (&notification.telegram_token, &notification.chat_id) else {
        return Ok(None);
    };
    if !notification.commands_enabled || token.is_empty() || chat_id.is_empty() {
        return Ok(None);
    }

    let report_dir = context
        .settings
        .schedule
        .report_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| env::temp_dir().join("heatwatch-reports"));

    let commands = BotCommands::new(
        context.router.clone(),
        context.persistence.clone(),
        context.dispatcher.clone(),
        report_dir,
        context.local_offset,
    );
    let bot = TelegramBot::new(notification, token, chat_id, commands, context.dispatcher.clone())
        .context("Failed to create telegram bot")?;

    Ok(Some(tokio::spawn(bot.run(shutdown.clone()))))
}

pub async fn run(settings: &Arc<Settings>) -> anyhow::Result<()> {
    let storage = Arc::new(
        Storage::new(settings.database.clone(), SchemaManager::default())
            .await
            .context("Failed to open storage")?,
    );
    DeviceRepository::new(storage.clone())
        .sync(&settings.devices)
        .await
        .context("Failed to register devices")?;

    let (trigger, shutdown) = shutdown::channel();

    let sink = sink_from_settings(&settings.notification)?;
    let (dispatcher, notifier) = NotificationDispatcher::spawn(
        sink,
        settings.notification.queue_capacity,
        shutdown.clone(),
    );

    let context = AppContext::new(settings.clone(), storage, dispatcher, shutdown.clone())?;

    let mut tasks = spawn_jobs(&context, &shutdown)?;
    tasks.extend(spawn_bot(&context, &shutdown)?);
    let mqtt = MqttService::new(
        &settings.gateway,
        context.router.clone(),
        context.coordinator.clone(),
        context.connection.clone(),
    );
    tasks.push(tokio::spawn(mqtt.run(shutdown.clone())));

    let app = create_app(&context);

    let ip_addr = settings
        .server
        .host
        .parse::<IpAddr>()
        .with_context(|| format!("Invalid server host {}", settings.server.host))?;
    let address = SocketAddr::from((ip_addr, settings.server.port));
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;

    tracing::info!("listening on {:?}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("shutting down");
            trigger.trigger();
        })
        .await?;

    tasks.push(notifier);
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            tracing::warn!("a background task did not stop in time");
        }
    }

    Ok(())
}
