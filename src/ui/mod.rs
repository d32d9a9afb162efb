//! User interface rendering and input handling.
//!
//! This module provides all UI-related functionality:
//!
//! - **canvas**: Cell grid drawing surface and the crossterm terminal canvas
//! - **keys**: Raw key codes and their translation to X keysyms
//! - **input**: Escape/Alt and Ctrl disambiguation, command rate limiting
//! - **viewer**: Poll loop tying input, viewport and redraws together
//!
//! # Input Routing
//!
//! - **Input to viewer**: keys are viewer commands (pan, zoom, mouse)
//! - **Input to remote**: keys are forwarded, except the back-tick toggle

pub mod canvas;
pub mod input;
pub mod keys;
pub mod viewer;

pub use canvas::TermCanvas;
pub use viewer::Viewer;
