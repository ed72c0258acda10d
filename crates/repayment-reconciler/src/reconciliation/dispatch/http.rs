use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Notifier, NotifyError, SideEffect};

/// Outbound URLs per side-effect kind. `{channel}` in the partner URL is
/// replaced with the channel slug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationTargets {
    pub crm: Option<String>,
    pub partner_ack: Option<String>,
    pub analytics: Option<String>,
    pub alerts: Option<String>,
}

impl NotificationTargets {
    pub fn target_for(&self, effect: &SideEffect) -> Option<String> {
        match effect {
            SideEffect::CrmSync { .. } => self.crm.clone(),
            SideEffect::PartnerAck { channel, .. } => self
                .partner_ack
                .as_ref()
                .map(|url| url.replace("{channel}", channel.slug())),
            SideEffect::AnalyticsEvent { .. } => self.analytics.clone(),
            SideEffect::OperatorAlert(_) => self.alerts.clone(),
        }
    }
}

pub struct HttpNotifier {
    client: reqwest::Client,
    targets: NotificationTargets,
}

impl HttpNotifier {
    pub fn new(targets: NotificationTargets, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("repayment-reconciler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| NotifyError::Transport(err.to_string()))?;

        Ok(Self { client, targets })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(&self, effect: &SideEffect) -> Result<(), NotifyError> {
        let Some(url) = self.targets.target_for(effect) else {
            debug!(effect = effect.label(), "no target configured; skipping delivery");
            return Ok(());
        };

        let response = self
            .client
            .post(&url)
            .json(effect)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
