//! Hand-written capability mocks shared by unit and integration tests.

mod mock_browser;
mod mock_replay;

pub use mock_browser::MockBrowser;
pub use mock_browser::MockLauncher;
pub use mock_replay::MockReplay;
