// src/http.rs

/// The status codes this layer knows how to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 200,
    NotModified = 304,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    NotAllowed = 405,
    TooLarge = 413,
    RangeUnsatisfiable = 416,
    InternalError = 500,
}

impl Status {
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn as_str(self) -> &'static str {
        status_as_string(self.code())
    }

    pub fn as_descriptive_str(self) -> &'static str {
        status_as_descriptive_string(self.code())
    }
}

/// Reason phrase for a status code. Codes outside the supported set map to
/// `"Invalid"`.
pub fn status_as_string(code: u16) -> &'static str {
    match code {
        200 => "OK",
        304 => "Not modified",
        400 => "Bad request",
        403 => "Forbidden",
        404 => "Not found",
        405 => "Not allowed",
        413 => "Request too large",
        416 => "Requested range unsatisfiable",
        500 => "Internal server error",
        _ => "Invalid",
    }
}

/// Longer, human-readable description, used as the body of generated error
/// responses.
pub fn status_as_descriptive_string(code: u16) -> &'static str {
    match code {
        200 => "Success!",
        304 => "The content has not changed since previous request.",
        400 => "The client has issued a bad request.",
        403 => "Access to this resource has been denied.",
        404 => "The requested resource could not be found on this server.",
        405 => "The requested method is not allowed by this server.",
        413 => "The request entity is too large.",
        416 => "The server can't supply the requested portion of the requested resource.",
        500 => "The server encountered an internal error that couldn't be recovered from.",
        _ => "Invalid",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"OPTIONS" => Method::Options,
            _ => Method::Unknown,
        }
    }
}

/// What a handler produces: body bytes appended to the connection's
/// response buffer, plus the MIME type for the Content-Type header.
pub struct Response<'a> {
    pub buffer: &'a mut Vec<u8>,
    pub mime_type: &'static str,
}

/// MIME type from the file name extension; first matching rule wins,
/// `application/octet-stream` otherwise. Matching is case-insensitive.
pub fn mime_type_for_file_name(file_name: &str) -> &'static str {
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return "application/octet-stream",
    };

    const TABLE: [(&str, &str); 6] = [
        ("css", "text/css"),
        ("htm", "text/html"),
        ("jpg", "image/jpeg"),
        ("js", "application/javascript"),
        ("png", "image/png"),
        ("txt", "text/plain"),
    ];

    for (candidate, mime) in TABLE {
        if ext.eq_ignore_ascii_case(candidate) {
            return mime;
        }
    }
    "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(status_as_string(404), "Not found");
        assert_eq!(status_as_string(200), "OK");
        assert_eq!(status_as_string(416), "Requested range unsatisfiable");
        assert_eq!(status_as_string(999), "Invalid");
        assert_eq!(status_as_string(0), "Invalid");
        assert_eq!(Status::InternalError.as_str(), "Internal server error");
    }

    #[test]
    fn descriptive_strings() {
        assert_eq!(
            status_as_descriptive_string(404),
            "The requested resource could not be found on this server."
        );
        assert_eq!(status_as_descriptive_string(201), "Invalid");
    }

    #[test]
    fn mime_mapping() {
        assert_eq!(mime_type_for_file_name("style.css"), "text/css");
        assert_eq!(mime_type_for_file_name("INDEX.HTM"), "text/html");
        assert_eq!(mime_type_for_file_name("app.js"), "application/javascript");
        assert_eq!(mime_type_for_file_name("photo.jpg"), "image/jpeg");
        assert_eq!(mime_type_for_file_name("logo.png"), "image/png");
        assert_eq!(mime_type_for_file_name("notes.txt"), "text/plain");
        assert_eq!(
            mime_type_for_file_name("archive.tar.gz"),
            "application/octet-stream"
        );
        assert_eq!(mime_type_for_file_name("README"), "application/octet-stream");
    }

    #[test]
    fn method_from_bytes() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"HEAD"), Method::Head);
        assert_eq!(Method::from_bytes(b"BREW"), Method::Unknown);
    }
}
