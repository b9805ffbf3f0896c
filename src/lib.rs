pub mod analyze;
pub mod api;
pub mod assistant;
pub mod compose;
pub mod context;
pub mod extract;
pub mod intent;
pub mod itinerary;
pub mod llm;
pub mod settings;
pub mod stage;
pub mod weather;
