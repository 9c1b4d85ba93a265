//! Command-line interface for the service manager

use argh::FromArgs;

/// Single-host external service lifecycle manager
#[derive(FromArgs, Debug)]
pub struct ManagerArgs {
    /// path to the service configuration file (default: service_config.yml)
    #[argh(option, short = 'c', default = "String::from(\"service_config.yml\")")]
    pub config: String,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,

    #[argh(subcommand)]
    pub action: Action,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Action {
    Start(StartAction),
    Stop(StopAction),
    Status(StatusAction),
    Restart(RestartAction),
    ConsulRegister(ConsulRegisterAction),
    ConsulUnregister(ConsulUnregisterAction),
    ConsulDiscover(ConsulDiscoverAction),
}

/// start all services, or a single named service
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "start")]
pub struct StartAction {
    /// service name (optional)
    #[argh(positional)]
    pub service: Option<String>,
}

/// stop all services, or a single named service
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "stop")]
pub struct StopAction {
    /// service name (optional)
    #[argh(positional)]
    pub service: Option<String>,
}

/// show the status of all tracked services
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "status")]
pub struct StatusAction {}

/// stop and start all services
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "restart")]
pub struct RestartAction {}

/// register all tracked services with consul
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "consul-register")]
pub struct ConsulRegisterAction {}

/// deregister all tracked services from consul
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "consul-unregister")]
pub struct ConsulUnregisterAction {}

/// list services known to consul
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "consul-discover")]
pub struct ConsulDiscoverAction {
    /// service name (optional)
    #[argh(positional)]
    pub service: Option<String>,
}
