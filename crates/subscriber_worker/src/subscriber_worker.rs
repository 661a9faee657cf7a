use anyhow::Context;
use common::domain::{
    DomainError, DomainResult, MessageHandler, MessageSubscriber, RunMode, TopicAdmin,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

pub struct SubscriberWorkerConfig {
    pub subscription_id: String,
    pub run_mode: RunMode,
    /// How long each listen window stays open.
    pub listen_timeout: Duration,
    /// Pause between listen windows in loop mode.
    pub check_interval: Duration,
}

pub struct SubscriberWorker {
    admin: Arc<dyn TopicAdmin>,
    subscriber: Arc<dyn MessageSubscriber>,
    handler: Arc<dyn MessageHandler>,
    config: SubscriberWorkerConfig,
}

impl SubscriberWorker {
    pub fn new(
        admin: Arc<dyn TopicAdmin>,
        subscriber: Arc<dyn MessageSubscriber>,
        handler: Arc<dyn MessageHandler>,
        config: SubscriberWorkerConfig,
    ) -> Self {
        debug!("initializing subscriber worker");
        Self {
            admin,
            subscriber,
            handler,
            config,
        }
    }

    #[instrument(skip(self), fields(subscription = %self.config.subscription_id))]
    pub async fn ensure_subscription_exists(&self) -> DomainResult<()> {
        let subscriptions = self.admin.list_subscriptions().await?;
        match subscriptions
            .iter()
            .find(|s| s.subscription_id == self.config.subscription_id)
        {
            Some(found) => {
                debug!(topic = %found.topic_id, exactly_once = found.exactly_once, "subscription found");
                Ok(())
            }
            None => Err(DomainError::NotFound(format!(
                "subscription {}",
                self.config.subscription_id
            ))),
        }
    }

    /// Deliver messages to the handler for one listen window, or less if `ctx`
    /// is cancelled first.
    pub async fn listen_once(&self, ctx: &CancellationToken) -> DomainResult<()> {
        let window = ctx.child_token();
        let subscription = self.subscriber.subscribe(
            &self.config.subscription_id,
            self.handler.clone(),
            window.clone(),
        );
        tokio::pin!(subscription);

        tokio::select! {
            result = &mut subscription => result,
            _ = tokio::time::sleep(self.config.listen_timeout) => {
                debug!(timeout = ?self.config.listen_timeout, "listen window closed");
                window.cancel();
                subscription.await
            }
        }
    }

    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        self.ensure_subscription_exists()
            .await
            .context("subscription check failed")?;

        info!(
            subscription = %self.config.subscription_id,
            mode = %self.config.run_mode,
            "subscriber started"
        );

        loop {
            let listened = self.listen_once(&ctx).await;

            if self.config.run_mode == RunMode::Once {
                listened.context("listening on subscription failed")?;
                break;
            }
            if let Err(e) = listened {
                error!(error = %e, "listening on subscription failed");
            }

            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("received shutdown signal, stopping subscriber");
                    break;
                }
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }

        Ok(())
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_process(
        self,
    ) -> Box<
        dyn FnOnce(
                CancellationToken,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send,
    > {
        Box::new(move |ctx| Box::pin(async move { self.run(ctx).await }))
    }
}
