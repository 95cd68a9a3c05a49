/// Daily and weekly maintenance jobs triggered on calendar boundaries.
pub mod calendar;
/// OpenAPI documentation generation.
pub mod documentation;
/// Push channel from the reconciler to participants and spectators.
pub mod gateway;
/// Memory and I/O circuit breaker of the reconciler.
pub mod health_guard;
/// Health check service.
pub mod health_service;
/// Challenge and rematch offers.
pub mod negotiation_service;
/// The reconciliation tick.
pub mod reconcile;
/// Self-rescheduling driver of the reconciliation tick.
pub mod scheduler;
/// Default session simulation step.
pub mod simulation;
/// Session store connection supervisor.
pub mod storage_supervisor;
/// Heartbeats, state fetches, spectating and claim-void.
pub mod user_service;
/// Live update WebSocket handling.
pub mod websocket_service;
