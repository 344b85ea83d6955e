use std::sync::Arc;

use gw_pool::Dispatcher;

use crate::config::Config;

pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
}
