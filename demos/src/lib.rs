#![deny(warnings, clippy::all, clippy::pedantic)]
