use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::interceptor::registry::Registry;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use crate::error::{TunnelError, to_setup_error};

/// Setting engine used for real networks.
pub fn default_setting_engine() -> SettingEngine {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );
    setting
}

pub fn build_api(setting: SettingEngine) -> Result<API, TunnelError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Two peers on an in-process virtual LAN, so the full handshake can run
/// without OS networking. Keep the value alive for as long as the peers
/// talk; dropping it leaves the router running until both APIs go away.
pub struct VirtualLan {
    router: Arc<AsyncMutex<Router>>,
}

impl VirtualLan {
    /// Returns the LAN and one API per peer (host at 10.0.0.2, joiner at
    /// 10.0.0.3).
    pub async fn new() -> Result<(VirtualLan, API, API), TunnelError> {
        let wan = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .map_err(to_setup_error)?,
        ));

        let host_net = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec!["10.0.0.2".to_owned()],
            ..Default::default()
        })));
        attach_to_router(&host_net, &wan).await?;

        let joiner_net = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec!["10.0.0.3".to_owned()],
            ..Default::default()
        })));
        attach_to_router(&joiner_net, &wan).await?;

        {
            let mut router = wan.lock().await;
            router.start().await.map_err(to_setup_error)?;
        }

        let host_api = build_api(virtual_setting_engine(host_net))?;
        let joiner_api = build_api(virtual_setting_engine(joiner_net))?;
        Ok((VirtualLan { router: wan }, host_api, joiner_api))
    }

    pub async fn stop(&self) {
        let mut router = self.router.lock().await;
        if let Err(err) = router.stop().await {
            tracing::debug!(
                target = "mc_tunnel::establish",
                error = %err,
                "virtual router stop failed"
            );
        }
    }
}

fn virtual_setting_engine(net: Arc<Net>) -> SettingEngine {
    let mut setting = SettingEngine::default();
    setting.set_vnet(Some(net));
    setting.set_ice_timeouts(
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_millis(200)),
    );
    setting
}

async fn attach_to_router(
    net: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), TunnelError> {
    let nic = net.get_nic().map_err(to_setup_error)?;
    {
        let nic_clone = Arc::clone(&nic);
        let mut router_guard = router.lock().await;
        router_guard
            .add_net(nic_clone)
            .await
            .map_err(to_setup_error)?;
    }
    {
        let nic_guard = nic.lock().await;
        nic_guard
            .set_router(Arc::clone(router))
            .await
            .map_err(to_setup_error)?;
    }
    Ok(())
}
