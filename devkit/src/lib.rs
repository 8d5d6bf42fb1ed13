/*!
# HydroLoop DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests du kernel HydroLoop avec:
- Gateway de commandes mock (requêtes enregistrées, pannes, réponses node)
- PID scripté et oracle statique pour piloter le contrôleur
- Fixtures de zones pH/EC
- Harness assemblant bus, tracker et store mémoire
*/

pub mod control_stubs;
pub mod fixtures;
pub mod gateway_stub;
pub mod test_utils;

pub use control_stubs::{ScriptedPidFactory, StaticOracle};
pub use fixtures::ZoneFixture;
pub use gateway_stub::MockGateway;
pub use test_utils::TestHarness;
