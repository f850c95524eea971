//! # Dispatcher
//!
//! [`Registry`] owns the route table and the interceptor arena and is the
//! registration surface. [`Dispatcher`] holds the declared modules and builds
//! the registry lazily on the first request.
//!
//! ## Lazy bootstrap
//!
//! - Fast path: `OnceLock::get`, no locking once initialised
//! - Slow path: a `Mutex` serialises the fallible initialiser; the first
//!   caller runs it, the others wait and then read the result
//! - A failed bootstrap is remembered; later calls get `Error::Bootstrap`
//!
//! After bootstrap the registry is read-only.

use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::handler::{Dispatch, Exchange, HandlerError};
use crate::interceptor::{Interceptor, Next};
use crate::module::{InterceptorDescriptor, Module, RouteDescriptor};
use crate::request::Request;
use crate::route::Route;
use crate::router::{Method, RouteTable};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::{debug, info};

/// Settings consumed once during bootstrap
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    /// Modules to scan, in order; empty means every declared module
    pub module_scan: Vec<String>,
    /// Debug mode (error details in 500 responses)
    pub debug: bool,
    /// Template engine reference, logged only
    pub template_engine: Option<String>,
}

/// Routes and interceptors, frozen after bootstrap
#[derive(Debug, Default)]
pub struct Registry {
    routes: RouteTable,
    interceptors: Vec<Interceptor>,
    debug: bool,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set debug mode
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Debug mode
    #[must_use]
    pub const fn debug(&self) -> bool {
        self.debug
    }

    /// Compile and add a route, then apply interceptors
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` or `Error::RouteConflict`.
    pub fn register_route(&mut self, descriptor: RouteDescriptor) -> Result<()> {
        let route = Route::compile(descriptor)?;
        debug!(method = %route.method(), pattern = %route.pattern(), "register route");
        self.routes.register(route)?;
        self.apply_all();
        Ok(())
    }

    /// Compile and add an interceptor, then apply interceptors
    ///
    /// # Errors
    ///
    /// Returns `Error::InterceptorConflict` if the name is taken, or
    /// `Error::InvalidInterceptorPattern`.
    pub fn register_interceptor(&mut self, descriptor: InterceptorDescriptor) -> Result<()> {
        if self.interceptors.iter().any(|i| i.name() == descriptor.name) {
            return Err(Error::InterceptorConflict {
                name: descriptor.name,
            });
        }
        let interceptor = Interceptor::compile(descriptor)?;
        debug!(name = %interceptor.name(), pattern = %interceptor.pattern(), "register interceptor");
        self.interceptors.push(interceptor);
        self.apply_all();
        Ok(())
    }

    /// Register every route and interceptor of each module, in order
    ///
    /// # Errors
    ///
    /// Fails on the first registration error.
    pub fn scan_modules(&mut self, modules: impl IntoIterator<Item = Module>) -> Result<()> {
        for module in modules {
            let (routes, interceptors) = module.into_parts();
            for route in routes {
                self.register_route(route)?;
            }
            for interceptor in interceptors {
                self.register_interceptor(interceptor)?;
            }
        }
        Ok(())
    }

    /// Append matching interceptors to routes they have not seen yet
    ///
    /// Idempotent. Interceptors are visited in registration order, so the
    /// earliest registered one ends up outermost. Returns the number of
    /// stages added.
    pub fn apply_all(&mut self) -> usize {
        let mut added = 0;
        for (id, interceptor) in self.interceptors.iter_mut().enumerate() {
            for route in self.routes.iter_mut() {
                if interceptor.visit(route) {
                    route.stages.push(id);
                    added += 1;
                }
            }
        }
        added
    }

    /// First route matching `(method, path)` and its captured arguments
    #[must_use]
    pub fn find_route(&self, method: Method, path: &str) -> Option<(&Route, Vec<String>)> {
        self.routes.find_route(method, path)
    }

    /// Run the call chain of the matching route
    ///
    /// # Errors
    ///
    /// Handler and interceptor errors pass through unchanged.
    pub fn dispatch(
        &self,
        method: Method,
        path: &str,
        exchange: &mut Exchange<'_>,
    ) -> std::result::Result<Dispatch, HandlerError> {
        let Some((route, args)) = self.find_route(method, path) else {
            return Ok(Dispatch::NotFound);
        };
        Next::new(&self.interceptors, route, &args)
            .run(exchange)
            .map(Dispatch::Handled)
    }

    /// The route table
    #[must_use]
    pub const fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Registered interceptors, in registration order
    #[must_use]
    pub fn interceptors(&self) -> &[Interceptor] {
        &self.interceptors
    }

    fn log_table(&self) {
        for route in self.routes.iter() {
            let chain: Vec<_> = route
                .stages()
                .iter()
                .filter_map(|&id| self.interceptors.get(id).map(Interceptor::name))
                .collect();
            info!(
                method = %route.method(),
                pattern = %route.pattern(),
                kind = ?route.kind(),
                interceptors = ?chain,
                "route"
            );
        }
    }
}

type ModuleFactory = Box<dyn FnOnce() -> Module + Send>;

enum InitState {
    Pending {
        modules: Vec<(String, ModuleFactory)>,
        config: BootstrapConfig,
    },
    Ready,
    Failed(String),
}

/// Request-time entry point
pub struct Dispatcher {
    registry: OnceLock<Registry>,
    init: Mutex<InitState>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry.get())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no modules
    #[must_use]
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            registry: OnceLock::new(),
            init: Mutex::new(InitState::Pending {
                modules: Vec::new(),
                config,
            }),
        }
    }

    /// Declare a module; `factory` runs during bootstrap if the module is
    /// selected by `module_scan`
    #[must_use]
    pub fn module<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce() -> Module + Send + 'static,
    {
        let state = self.init.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let InitState::Pending { modules, .. } = state {
            modules.push((name.into(), Box::new(factory)));
        }
        self
    }

    /// Whether bootstrap already succeeded
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.registry.get().is_some()
    }

    /// The registry, bootstrapping it on first use
    ///
    /// # Errors
    ///
    /// Returns the bootstrap error on the call that ran it, and
    /// `Error::Bootstrap` on every later call.
    pub fn registry(&self) -> Result<&Registry> {
        if let Some(registry) = self.registry.get() {
            return Ok(registry);
        }

        let mut state = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(registry) = self.registry.get() {
            return Ok(registry);
        }

        match std::mem::replace(&mut *state, InitState::Ready) {
            InitState::Pending { modules, config } => match bootstrap(modules, &config) {
                Ok(registry) => {
                    let registry = self.registry.get_or_init(|| registry);
                    drop(state);
                    Ok(registry)
                }
                Err(e) => {
                    *state = InitState::Failed(e.to_string());
                    Err(e)
                }
            },
            InitState::Failed(message) => {
                *state = InitState::Failed(message.clone());
                Err(Error::Bootstrap { message })
            }
            InitState::Ready => Err(Error::Bootstrap {
                message: "registry missing after bootstrap".to_string(),
            }),
        }
    }

    /// Resolve `(method, path)` and run its call chain
    ///
    /// # Errors
    ///
    /// `HandlerError::Core(Error::Bootstrap)` if bootstrap failed; otherwise
    /// handler errors pass through.
    pub fn dispatch(
        &self,
        method: Method,
        path: &str,
        exchange: &mut Exchange<'_>,
    ) -> std::result::Result<Dispatch, HandlerError> {
        self.registry()?.dispatch(method, path, exchange)
    }

    /// Build the exchange for a request and dispatch it
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch`].
    pub fn handle(
        &self,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> std::result::Result<Dispatch, HandlerError> {
        let registry = self.registry()?;
        let mut exchange = Exchange::new(request, ctx, registry);
        registry.dispatch(request.method, &request.path, &mut exchange)
    }
}

fn bootstrap(mut modules: Vec<(String, ModuleFactory)>, config: &BootstrapConfig) -> Result<Registry> {
    info!(debug = config.debug, "bootstrap dispatcher...");
    if let Some(engine) = &config.template_engine {
        info!(template_engine = %engine, "template engine");
    }

    let selected = if config.module_scan.is_empty() {
        modules
    } else {
        let mut selected = Vec::with_capacity(config.module_scan.len());
        for name in &config.module_scan {
            let Some(pos) = modules.iter().position(|(declared, _)| declared == name) else {
                let listed_twice = selected.iter().any(|(s, _): &(String, _)| s == name);
                return Err(if listed_twice {
                    Error::Settings {
                        message: format!("module '{name}' is listed more than once in module_scan"),
                    }
                } else {
                    Error::UnknownModule { name: name.clone() }
                });
            };
            selected.push(modules.remove(pos));
        }
        selected
    };

    let mut registry = Registry::new().with_debug(config.debug);
    for (name, factory) in selected {
        info!(module = %name, "scan module");
        registry.scan_modules([factory()])?;
    }
    registry.log_table();
    info!(
        routes = registry.routes.len(),
        interceptors = registry.interceptors.len(),
        "bootstrap done"
    );
    Ok(registry)
}
