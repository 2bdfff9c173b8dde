mod analyzer;
mod iter;
mod perfschema;
mod ticker;
