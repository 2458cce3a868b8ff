use tonic::service::RoutesBuilder;

/// Adds gRPC services to the routes served by a
/// [`BoundServer`](super::BoundServer).
///
/// Called once, when serving starts. Routes outlive rebinds: the same
/// services keep answering on whichever listener is current.
///
/// Any `Fn(&mut RoutesBuilder)` closure is a registrar:
///
/// ```rust,no_run
/// use tonic::service::RoutesBuilder;
///
/// let (_reporter, health) = tonic_health::server::health_reporter();
/// let registrar = move |routes: &mut RoutesBuilder| {
///     routes.add_service(health.clone());
/// };
/// # let _ = registrar;
/// ```
pub trait Registrar: Send + Sync + 'static {
    /// Add this registrar's services to `routes`.
    fn register(&self, routes: &mut RoutesBuilder);
}

impl<F> Registrar for F
where
    F: Fn(&mut RoutesBuilder) + Send + Sync + 'static,
{
    fn register(&self, routes: &mut RoutesBuilder) {
        self(routes)
    }
}

/// Registrar that adds nothing; every call is answered `Unimplemented`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoServices;

impl Registrar for NoServices {
    fn register(&self, _routes: &mut RoutesBuilder) {}
}
