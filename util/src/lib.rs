//! Demo binaries exercising the riptide runtime end to end.
