use std::sync::Arc;

use crate::{
    config::Config,
    store::{Store, init_redis},
};

pub struct State {
    pub config: Config,
    pub store: Store,
}

impl State {
    pub async fn new() -> Arc<Self> {
        let config = Config::load();
        let redis = init_redis(&config.redis_url).await;

        Arc::new(Self {
            config,
            store: Store::redis(redis),
        })
    }
}
