//! 存活看门狗
//!
//! 各组件注册后定期ping，检查循环发现某组件超过阈值没有ping时，
//! 认为进程已经卡死，直接退出交给外部supervisor重启。
//! 流水线崩溃后靠水位线重新播种恢复，进程内不做自愈。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct ComponentState {
    registered_at: Instant,
    last_ping: Option<Instant>,
    start_grace: Duration,
    timeout: Duration,
}

impl ComponentState {
    /// 当前存活截止时间
    fn deadline(&self) -> Instant {
        match self.last_ping {
            Some(t) => t + self.timeout,
            None => self.registered_at + self.start_grace,
        }
    }
}

/// 存活看门狗
#[derive(Clone)]
pub struct Watchdog {
    components: Arc<Mutex<HashMap<String, ComponentState>>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            components: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 注册组件，宽限期内允许没有任何ping
    pub fn register(&self, name: &str, start_grace: Duration, timeout: Duration) {
        let mut components = self.components.lock().unwrap();
        components.insert(
            name.to_string(),
            ComponentState {
                registered_at: Instant::now(),
                last_ping: None,
                start_grace,
                timeout,
            },
        );
        info!(target: "watchdog", "注册组件: {}", name);
    }

    /// 组件心跳，未注册的名字直接忽略
    pub fn ping(&self, name: &str) {
        let mut components = self.components.lock().unwrap();
        if let Some(state) = components.get_mut(name) {
            state.last_ping = Some(Instant::now());
            debug!(target: "watchdog", "收到ping: {}", name);
        }
    }

    /// 检查是否有组件超时，返回第一个超时组件的名字
    pub fn check(&self) -> Option<String> {
        let components = self.components.lock().unwrap();
        let now = Instant::now();
        components
            .iter()
            .find(|(_, state)| now > state.deadline())
            .map(|(name, _)| name.clone())
    }

    /// 启动后台检查循环，发现超时组件时终止进程
    pub fn spawn_check_loop(&self, check_interval: Duration) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(check_interval);
            loop {
                timer.tick().await;
                if let Some(name) = watchdog.check() {
                    error!(target: "watchdog", "组件 {} 心跳超时，终止进程等待外部重启", name);
                    std::process::exit(1);
                }
            }
        })
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grace_period_allows_no_ping() {
        let watchdog = Watchdog::new();
        watchdog.register("u", Duration::from_secs(60), Duration::from_secs(60));
        assert_eq!(watchdog.check(), None);
    }

    #[test]
    fn test_stale_component_detected() {
        let watchdog = Watchdog::new();
        watchdog.register("u", Duration::from_millis(0), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(watchdog.check(), Some("u".to_string()));
    }

    #[test]
    fn test_ping_extends_deadline() {
        let watchdog = Watchdog::new();
        watchdog.register("u", Duration::from_millis(0), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        watchdog.ping("u");
        assert_eq!(watchdog.check(), None);
    }
}
