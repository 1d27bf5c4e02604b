//! Output formatting for guest values.
//!
//! `format_value` never fails and always terminates: every property access
//! that could throw is caught (clearing the pending exception), and arrays
//! carry a recursion guard.

use rquickjs::function::This;
use rquickjs::{CatchResultExt, CaughtError, Coerced, Ctx, FromJs, Function, Object, Type, Value};

/// Arrays longer than this render only their first elements.
pub const MAX_ARRAY_ITEMS: usize = 100;

/// Structured objects are cut off after this many characters.
pub const MAX_OBJECT_CHARS: usize = 5000;

/// Nesting limit for recursive rendering.
pub const MAX_DEPTH: usize = 32;

const BUFFER_HEX_CHARS: usize = 50;
const GENERIC_TAG: &str = "[object Object]";

/// Render a single value.
pub fn format_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    Formatter::new(ctx).format(value)
}

/// Render console arguments: each value formatted, joined by a space.
pub fn format_args<'js>(ctx: &Ctx<'js>, values: &[Value<'js>]) -> String {
    let mut formatter = Formatter::new(ctx);
    values
        .iter()
        .map(|value| formatter.format(value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a value is a listener handle, i.e. its constructor is named `Server`.
pub fn is_server_handle<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    constructor_name(ctx, obj).as_deref() == Some("Server")
}

/// Whether a value is an object exposing a callable `then`.
pub fn is_thenable<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> bool {
    if value.is_function() {
        return false;
    }
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get::<_, Value>("then")
        .catch(ctx)
        .map(|then| then.is_function())
        .unwrap_or(false)
}

/// Render a caught guest exception as `Name: message`.
pub fn format_caught<'js>(ctx: &Ctx<'js>, err: CaughtError<'js>) -> String {
    match err {
        CaughtError::Exception(exception) => {
            format_value(ctx, &exception.into_object().into_value())
        }
        CaughtError::Value(value) => format_value(ctx, &value),
        CaughtError::Error(err) => err.to_string(),
    }
}

fn constructor_name<'js>(ctx: &Ctx<'js>, obj: &Object<'js>) -> Option<String> {
    let ctor: Value = obj.get("constructor").catch(ctx).ok()?;
    let ctor = ctor.as_object()?;
    let name: Value = ctor.get("name").catch(ctx).ok()?;
    name.as_string()?.to_string().ok()
}

struct Formatter<'a, 'js> {
    ctx: &'a Ctx<'js>,
    seen: Vec<Value<'js>>,
}

impl<'a, 'js> Formatter<'a, 'js> {
    fn new(ctx: &'a Ctx<'js>) -> Self {
        Self {
            ctx,
            seen: Vec::new(),
        }
    }

    fn format(&mut self, value: &Value<'js>) -> String {
        match value.type_of() {
            Type::Uninitialized | Type::Undefined => "undefined".to_string(),
            Type::Null => "null".to_string(),
            Type::Bool | Type::Int | Type::Float | Type::String => self.coerce(value),
            Type::BigInt => format!("{}n", self.coerce(value)),
            Type::Symbol => self.symbol(value),
            _ if value.is_function() => self.function(value),
            _ => match value.as_object() {
                Some(obj) => self.object(value, obj),
                None => self.coerce(value),
            },
        }
    }

    fn coerce(&self, value: &Value<'js>) -> String {
        Coerced::<String>::from_js(self.ctx, value.clone())
            .catch(self.ctx)
            .map(|s| s.0)
            .unwrap_or_else(|_| GENERIC_TAG.to_string())
    }

    fn symbol(&self, value: &Value<'js>) -> String {
        let string_fn: Option<Function> = self.ctx.globals().get("String").catch(self.ctx).ok();
        string_fn
            .and_then(|f| f.call::<_, String>((value.clone(),)).catch(self.ctx).ok())
            .unwrap_or_else(|| "Symbol()".to_string())
    }

    fn function(&self, value: &Value<'js>) -> String {
        let name = value
            .as_object()
            .and_then(|obj| obj.get::<_, Value>("name").catch(self.ctx).ok())
            .and_then(|name| name.as_string().and_then(|s| s.to_string().ok()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "anonymous".to_string());
        format!("[Function: {name}]")
    }

    fn object(&mut self, value: &Value<'js>, obj: &Object<'js>) -> String {
        if self.seen.iter().any(|seen| seen == value) {
            return "[Circular]".to_string();
        }
        if self.seen.len() >= MAX_DEPTH {
            return self.tag(value);
        }

        if self.is_buffer(value) {
            return self.buffer(obj);
        }

        if value.is_array() {
            self.seen.push(value.clone());
            let rendered = self.array(obj);
            self.seen.pop();
            return rendered;
        }

        let tag = self.tag(value);
        match tag.as_str() {
            "[object Date]" => return self.date(obj),
            "[object RegExp]" => return self.coerce(value),
            "[object Error]" => return self.error(obj),
            _ => {}
        }
        if value.type_of() == Type::Exception {
            return self.error(obj);
        }

        if constructor_name(self.ctx, obj).as_deref() == Some("Server") {
            return "[Server Object]".to_string();
        }

        self.structured(value).unwrap_or(tag)
    }

    fn array(&mut self, obj: &Object<'js>) -> String {
        let len: usize = obj
            .get::<_, f64>("length")
            .catch(self.ctx)
            .map(|n| n.max(0.0) as usize)
            .unwrap_or(0);
        let shown = len.min(MAX_ARRAY_ITEMS);

        let mut items = Vec::with_capacity(shown);
        for index in 0..shown {
            let item = match obj.get::<_, Value>(index as u32).catch(self.ctx) {
                Ok(item) => item,
                Err(_) => Value::new_undefined(self.ctx.clone()),
            };
            items.push(self.format(&item));
        }

        if len > MAX_ARRAY_ITEMS {
            format!("[{}]... ({} items)", items.join(", "), len)
        } else {
            format!("[{}]", items.join(", "))
        }
    }

    fn is_buffer(&self, value: &Value<'js>) -> bool {
        let buffer: Option<Object> = self.ctx.globals().get("Buffer").catch(self.ctx).ok();
        let Some(buffer) = buffer else {
            return false;
        };
        let is_buffer: Option<Function> = buffer.get("isBuffer").catch(self.ctx).ok();
        is_buffer
            .and_then(|f| {
                f.call::<_, bool>((This(buffer.clone()), value.clone()))
                    .catch(self.ctx)
                    .ok()
            })
            .unwrap_or(false)
    }

    fn buffer(&self, obj: &Object<'js>) -> String {
        let hex = obj
            .get::<_, Function>("toString")
            .catch(self.ctx)
            .ok()
            .and_then(|f| {
                f.call::<_, String>((This(obj.clone()), "hex"))
                    .catch(self.ctx)
                    .ok()
            })
            .unwrap_or_default();
        let shown: String = hex.chars().take(BUFFER_HEX_CHARS).collect();
        format!("<Buffer {shown}...>")
    }

    fn date(&self, obj: &Object<'js>) -> String {
        obj.get::<_, Function>("toISOString")
            .catch(self.ctx)
            .ok()
            .and_then(|f| f.call::<_, String>((This(obj.clone()),)).catch(self.ctx).ok())
            .unwrap_or_else(|| "Invalid Date".to_string())
    }

    fn error(&self, obj: &Object<'js>) -> String {
        let read = |key: &str| -> String {
            obj.get::<_, Value>(key)
                .catch(self.ctx)
                .ok()
                .filter(|v| !v.is_undefined())
                .map(|v| self.coerce(&v))
                .unwrap_or_default()
        };
        let name = read("name");
        let name = if name.is_empty() { "Error".to_string() } else { name };
        format!("{}: {}", name, read("message"))
    }

    fn structured(&self, value: &Value<'js>) -> Option<String> {
        let json: Object = self.ctx.globals().get("JSON").catch(self.ctx).ok()?;
        let stringify: Function = json.get("stringify").catch(self.ctx).ok()?;
        let out: Value = stringify
            .call((
                This(json),
                value.clone(),
                Value::new_null(self.ctx.clone()),
                2,
            ))
            .catch(self.ctx)
            .ok()?;
        let text = out.as_string()?.to_string().ok()?;

        if text.chars().count() > MAX_OBJECT_CHARS {
            let head: String = text.chars().take(MAX_OBJECT_CHARS).collect();
            Some(format!("{head}... (truncated)"))
        } else {
            Some(text)
        }
    }

    fn tag(&self, value: &Value<'js>) -> String {
        let to_string: Option<Function> = self
            .ctx
            .globals()
            .get::<_, Object>("Object")
            .and_then(|o| o.get::<_, Object>("prototype"))
            .and_then(|p| p.get::<_, Function>("toString"))
            .catch(self.ctx)
            .ok();
        to_string
            .and_then(|f| {
                f.call::<_, String>((This(value.clone()),))
                    .catch(self.ctx)
                    .ok()
            })
            .unwrap_or_else(|| GENERIC_TAG.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn render(source: &str) -> String {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            let value: Value = ctx.eval(source).unwrap();
            format_value(&ctx, &value)
        })
    }

    #[test]
    fn test_primitives() {
        assert_eq!(render("null"), "null");
        assert_eq!(render("undefined"), "undefined");
        assert_eq!(render("'hello'"), "hello");
        assert_eq!(render("42"), "42");
        assert_eq!(render("1.5"), "1.5");
        assert_eq!(render("true"), "true");
        assert_eq!(render("10n ** 20n"), "100000000000000000000n");
        assert_eq!(render("Symbol('tag')"), "Symbol(tag)");
    }

    #[test]
    fn test_functions() {
        assert_eq!(render("(function add(a, b) { return a + b })"), "[Function: add]");
        assert_eq!(render("(() => {})"), "[Function: anonymous]");
        assert_eq!(render("(class Point {})"), "[Function: Point]");
    }

    #[test]
    fn test_arrays() {
        assert_eq!(render("[1, 'a', null, [2, 3]]"), "[1, a, null, [2, 3]]");
        assert_eq!(render("[]"), "[]");
    }

    #[test]
    fn test_array_truncation() {
        let out = render("Array.from({ length: 150 }, (_, i) => i)");
        assert!(out.ends_with("... (150 items)"));
        let body = out.trim_start_matches('[').split(']').next().unwrap();
        assert_eq!(body.split(", ").count(), 100);
        assert!(body.ends_with("99"));
    }

    #[test]
    fn test_self_referencing_array() {
        let out = render("const a = [1]; a.push(a); a");
        assert_eq!(out, "[1, [Circular]]");
    }

    #[test]
    fn test_cyclic_object_falls_back_to_tag() {
        let out = render("const a = { name: 'a' }; a.self = a; a");
        assert_eq!(out, "[object Object]");
    }

    #[test]
    fn test_dates_regex_errors() {
        assert_eq!(
            render("new Date(Date.UTC(2024, 0, 2, 3, 4, 5))"),
            "2024-01-02T03:04:05.000Z"
        );
        assert_eq!(render("new Date(NaN)"), "Invalid Date");
        assert_eq!(render("/ab+c/gi"), "/ab+c/gi");
        assert_eq!(render("new TypeError('bad input')"), "TypeError: bad input");
        assert_eq!(
            render("class ValidationError extends Error { constructor(m) { super(m); this.name = 'ValidationError' } }; new ValidationError('nope')"),
            "ValidationError: nope"
        );
    }

    #[test]
    fn test_server_placeholder() {
        let out = render("class Server { constructor() { this.connections = new Array(10).fill({}) } }; new Server()");
        assert_eq!(out, "[Server Object]");
    }

    #[test]
    fn test_object_pretty_printed() {
        assert_eq!(render("({ a: 1 })"), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_object_truncated() {
        let out = render("({ text: 'x'.repeat(6000) })");
        assert!(out.ends_with("... (truncated)"));
        assert_eq!(out.chars().count(), MAX_OBJECT_CHARS + "... (truncated)".len());
    }

    #[test]
    fn test_throwing_getter_is_contained() {
        let out = render("({ get boom() { throw new Error('no') } })");
        assert_eq!(out, "[object Object]");
    }

    #[test]
    fn test_format_args_joins_with_space() {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            let values: Vec<Value> = vec![
                ctx.eval("'[Warn]'").unwrap(),
                ctx.eval("1").unwrap(),
                ctx.eval("[true]").unwrap(),
            ];
            assert_eq!(format_args(&ctx, &values), "[Warn] 1 [true]");
        });
    }

    #[test]
    fn test_thenable_and_server_detection() {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            let promise: Value = ctx.eval("Promise.resolve(1)").unwrap();
            let thenable: Value = ctx.eval("({ then() {} })").unwrap();
            let plain: Value = ctx.eval("({ then: 1 })").unwrap();
            assert!(is_thenable(&ctx, &promise));
            assert!(is_thenable(&ctx, &thenable));
            assert!(!is_thenable(&ctx, &plain));

            let server: Value = ctx.eval("new (class Server {})()").unwrap();
            assert!(is_server_handle(&ctx, &server));
            assert!(!is_server_handle(&ctx, &plain));
        });
    }
}
