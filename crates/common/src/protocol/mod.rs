// Wire shapes exchanged between the daemon and its browser UI.

pub mod http;
