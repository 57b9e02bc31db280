use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {}", .source)]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("XML error: {}", .source)]
    Xml {
        #[from]
        source: roxmltree::Error,
    },
    #[error("Import error: {}", .what)]
    Import { what: String },
    #[error("Export error: {}", .what)]
    Export { what: String },
    #[error("Schema error: {}", .what)]
    Schema { what: String },
    #[error("Unit error: {}", .what)]
    Unit { what: String },
    #[error("Model error: {}", .what)]
    Model { what: String },
    #[error("Parse error: {}", .what)]
    Parse { what: String },
}

pub fn import_error<T: Into<String>>(what: T) -> Error {
    Error::Import { what: what.into() }
}

pub fn export_error<T: Into<String>>(what: T) -> Error {
    Error::Export { what: what.into() }
}

pub fn schema_error<T: Into<String>>(what: T) -> Error {
    Error::Schema { what: what.into() }
}

pub fn unit_error<T: Into<String>>(what: T) -> Error {
    Error::Unit { what: what.into() }
}

pub fn model_error<T: Into<String>>(what: T) -> Error {
    Error::Model { what: what.into() }
}

pub fn parse_error<T: Into<String>>(what: T) -> Error {
    Error::Parse { what: what.into() }
}
