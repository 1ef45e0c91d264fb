// File: src/value.rs
//
// Runtime value types for the Pluto language.
// One tagged enum covers every value the VM can manipulate: primitives,
// collections, containers, callables, classes, and the transient
// control-flow sentinels. Compound values are reference-counted so that
// assignment and argument passing share structure.

use crate::bytecode::Instruction;
use ahash::AHashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/* Type tags */
pub const RETURN_VALUE_TYPE: &str = "<return value>";
pub const FUNCTION_TYPE: &str = "<function>";
pub const NEXT_TYPE: &str = "<next>";
pub const BREAK_TYPE: &str = "<break>";

/* Capability tags, matched structurally by `matches_type` */
pub const COLLECTION_TYPE: &str = "<collection>";
pub const CONTAINER_TYPE: &str = "<container>";
pub const HASHER_TYPE: &str = "<hasher>";
pub const ANY_TYPE: &str = "<any>";

pub const NUMBER_TYPE: &str = "<number>";
pub const BOOLEAN_TYPE: &str = "<boolean>";
pub const STRING_TYPE: &str = "<string>";
pub const CHAR_TYPE: &str = "<char>";
pub const ARRAY_TYPE: &str = "<array>";
pub const NULL_TYPE: &str = "<null>";
pub const BLOCK_TYPE: &str = "<block>";
pub const TUPLE_TYPE: &str = "<tuple>";
pub const MAP_TYPE: &str = "<map>";
pub const CLASS_TYPE: &str = "<class>";
pub const INSTANCE_TYPE: &str = "<instance>";

/// One element of a function's defining pattern: a literal identifier
/// that a call must spell exactly, or a named parameter that captures
/// an argument.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternItem {
    Ident(String),
    Param(String),
}

impl PatternItem {
    pub fn is_param(&self) -> bool {
        matches!(self, PatternItem::Param(_))
    }
}

/// Render a defining pattern in call-pattern form, e.g. "slice $ from $ to $"
pub fn pattern_to_string(pattern: &[PatternItem]) -> String {
    pattern
        .iter()
        .map(|item| match item {
            PatternItem::Ident(name) => name.as_str(),
            PatternItem::Param(_) => "$",
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// What CALL_FN should do instead of (or around) running the body.
///
/// Kept as plain data rather than a function pointer so Function values
/// stay cloneable and comparable.
#[derive(Debug, Clone)]
pub enum OnCall {
    /// Construct an instance of the named class, bind `self`, run the
    /// body, and return `self`
    Init { class: String },
    /// Dispatch to the named entry in the builtin table
    Builtin(&'static str),
    /// Bind `self` to the receiver before running the body (methods)
    Bound { receiver: Box<Value> },
}

/// A compiled function, identified by its pattern
#[derive(Debug, Clone)]
pub struct Function {
    pub pattern: Vec<PatternItem>,
    pub body: Rc<Vec<Instruction>>,
    pub constants: Rc<Vec<Value>>,
    pub names: Vec<String>,
    pub patterns: Vec<String>,
    pub on_call: Option<OnCall>,
}

impl Function {
    pub fn pattern_string(&self) -> String {
        pattern_to_string(&self.pattern)
    }

    /// Pattern-shape equality: literals must match by spelling,
    /// parameters match any parameter
    pub fn same_pattern(&self, other: &Function) -> bool {
        if self.pattern.len() != other.pattern.len() {
            return false;
        }

        self.pattern.iter().zip(other.pattern.iter()).all(|(a, b)| match (a, b) {
            (PatternItem::Param(_), PatternItem::Param(_)) => true,
            (PatternItem::Ident(x), PatternItem::Ident(y)) => x == y,
            _ => false,
        })
    }
}

/// An anonymous callable. A block captures its compiled body and
/// parameter list, not the enclosing scope: DO_BLOCK drives it with the
/// invoking frame's store.
#[derive(Debug, Clone)]
pub struct Block {
    pub params: Vec<String>,
    pub body: Rc<Vec<Instruction>>,
    pub constants: Rc<Vec<Value>>,
    pub names: Vec<String>,
    pub patterns: Vec<String>,
}

/// A class. The parent is stored by name and resolved through the store
/// at dispatch time, which keeps Class a plain value the compiler can
/// emit as a constant.
#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub parent: Option<String>,
    pub methods: Vec<Value>,
}

/// An instance of a class: a base class reference plus a field map
#[derive(Debug, Clone)]
pub struct Instance {
    pub base: Rc<Class>,
    pub data: AHashMap<String, Value>,
}

/// Twin-table map: both tables are keyed by the hash digest, one holding
/// the original key object and one the value. The two key sets are
/// always identical.
#[derive(Debug, Clone, Default)]
pub struct MapData {
    pub keys: AHashMap<String, Value>,
    pub values: AHashMap<String, Value>,
}

impl MapData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keyed read; None when the key is missing or unhashable
    pub fn get(&self, key: &Value) -> Option<Value> {
        let hash = key.hash_key()?;
        self.values.get(&hash).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<Value> {
        self.get(&Value::string(key))
    }

    /// Keyed write; silently ignores unhashable keys (callers that care
    /// check `is_hasher` first and report WrongType)
    pub fn set(&mut self, key: Value, value: Value) {
        if let Some(hash) = key.hash_key() {
            self.keys.insert(hash.clone(), key);
            self.values.insert(hash, value);
        }
    }

    pub fn key_objects(&self) -> Vec<Value> {
        self.keys.values().cloned().collect()
    }

    pub fn value_objects(&self) -> Vec<Value> {
        self.values.values().cloned().collect()
    }
}

/// A runtime value
#[derive(Clone)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    Str(Rc<RefCell<String>>),
    Char(char),
    Null,
    Tuple(Rc<RefCell<Vec<Value>>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<MapData>>),
    Block(Rc<Block>),
    Function(Rc<Function>),
    Class(Rc<Class>),
    Instance(Rc<RefCell<Instance>>),
    /// Wrapped return value, unwrapped at the call boundary
    Return(Box<Value>),
    /// Loop sentinels
    Next,
    Break,
}

impl Value {
    /* Constructors */

    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(Rc::new(RefCell::new(s.into())))
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn tuple(elements: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(RefCell::new(elements)))
    }

    pub fn map(data: MapData) -> Self {
        Value::Map(Rc::new(RefCell::new(data)))
    }

    pub fn instance(base: Rc<Class>) -> Self {
        Value::Instance(Rc::new(RefCell::new(Instance { base, data: AHashMap::new() })))
    }

    /* Type tags and capabilities */

    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::Number(_) => NUMBER_TYPE,
            Value::Boolean(_) => BOOLEAN_TYPE,
            Value::Str(_) => STRING_TYPE,
            Value::Char(_) => CHAR_TYPE,
            Value::Null => NULL_TYPE,
            Value::Tuple(_) => TUPLE_TYPE,
            Value::Array(_) => ARRAY_TYPE,
            Value::Map(_) => MAP_TYPE,
            Value::Block(_) => BLOCK_TYPE,
            Value::Function(_) => FUNCTION_TYPE,
            Value::Class(_) => CLASS_TYPE,
            Value::Instance(_) => INSTANCE_TYPE,
            Value::Return(_) => RETURN_VALUE_TYPE,
            Value::Next => NEXT_TYPE,
            Value::Break => BREAK_TYPE,
        }
    }

    /// Ordered, indexable values: Array, Tuple, String
    pub fn is_collection(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Tuple(_) | Value::Str(_))
    }

    /// Keyed values: Map and Instance
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Map(_) | Value::Instance(_))
    }

    /// Values with a stable string digest, usable as map keys
    pub fn is_hasher(&self) -> bool {
        matches!(
            self,
            Value::Number(_) | Value::Boolean(_) | Value::Str(_) | Value::Char(_) | Value::Null
        )
    }

    /// Convertible to a 64-bit float. Only Number qualifies.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Capability-aware type check used by builtin coercion. The
    /// capability tags match structurally; any other tag matches the
    /// exact type tag.
    pub fn matches_type(&self, tag: &str) -> bool {
        match tag {
            ANY_TYPE => true,
            COLLECTION_TYPE => self.is_collection(),
            CONTAINER_TYPE => self.is_container(),
            HASHER_TYPE => self.is_hasher(),
            _ => self.type_tag() == tag,
        }
    }

    /* Equality */

    /// Deep structural equality. Equality never crosses variants: the
    /// hash digest includes the type tag, so `3 == '3'` is false.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => *a.borrow() == *b.borrow(),
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Tuple(a), Value::Tuple(b)) => elements_equal(&a.borrow(), &b.borrow()),
            (Value::Array(a), Value::Array(b)) => elements_equal(&a.borrow(), &b.borrow()),
            (Value::Map(a), Value::Map(b)) => {
                let (a, b) = (a.borrow(), b.borrow());

                a.values.len() == b.values.len()
                    && a.values.iter().all(|(hash, val)| {
                        b.values.get(hash).map(|other| val.equals(other)).unwrap_or(false)
                    })
            }
            (Value::Block(_), Value::Block(_)) => true,
            (Value::Function(a), Value::Function(b)) => a.same_pattern(b),
            (Value::Class(a), Value::Class(b)) => a.name == b.name,
            (Value::Instance(a), Value::Instance(b)) => {
                let (a, b) = (a.borrow(), b.borrow());

                a.base.name == b.base.name
                    && a.data.len() == b.data.len()
                    && a.data.iter().all(|(field, val)| {
                        b.data.get(field).map(|other| val.equals(other)).unwrap_or(false)
                    })
            }
            (Value::Return(a), Value::Return(b)) => a.equals(b),
            (Value::Next, Value::Next) => true,
            (Value::Break, Value::Break) => true,
            _ => false,
        }
    }

    /* Hashing */

    /// Stable string digest: type tag plus canonical form
    pub fn hash_key(&self) -> Option<String> {
        match self {
            Value::Number(n) => Some(format!("number {}", n)),
            Value::Boolean(b) => Some(format!("boolean {}", b)),
            Value::Str(s) => Some(format!("string {}", s.borrow())),
            Value::Char(c) => Some(format!("char {}", c)),
            Value::Null => Some("null".to_string()),
            _ => None,
        }
    }

    /* Truthiness */

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0,
            _ => match self.elements() {
                Some(elements) => !elements.is_empty(),
                None => true,
            },
        }
    }

    /* Collection access */

    /// Ordered iteration for collections; None for everything else
    pub fn elements(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(a) => Some(a.borrow().clone()),
            Value::Tuple(t) => Some(t.borrow().clone()),
            Value::Str(s) => Some(s.borrow().chars().map(Value::Char).collect()),
            _ => None,
        }
    }

    /// Indexed read; None when out of range or not a collection
    pub fn get_index(&self, index: usize) -> Option<Value> {
        match self {
            Value::Array(a) => a.borrow().get(index).cloned(),
            Value::Tuple(t) => t.borrow().get(index).cloned(),
            Value::Str(s) => s.borrow().chars().nth(index).map(Value::Char),
            _ => None,
        }
    }

    /// Indexed write. Writes out of `[0, len)` are no-ops and do not
    /// fail; string writes require a Char and replace one scalar.
    pub fn set_index(&self, index: usize, value: Value) {
        match self {
            Value::Array(a) => {
                let mut elements = a.borrow_mut();
                if index < elements.len() {
                    elements[index] = value;
                }
            }
            Value::Tuple(t) => {
                let mut elements = t.borrow_mut();
                if index < elements.len() {
                    elements[index] = value;
                }
            }
            Value::Str(s) => {
                if let Value::Char(ch) = value {
                    let mut text = s.borrow_mut();
                    if index < text.chars().count() {
                        *text = text
                            .chars()
                            .enumerate()
                            .map(|(i, c)| if i == index { ch } else { c })
                            .collect();
                    }
                }
            }
            _ => {}
        }
    }

    /* Container access */

    /// Keyed read for Map and Instance
    pub fn get(&self, key: &Value) -> Option<Value> {
        match self {
            Value::Map(m) => m.borrow().get(key),
            Value::Instance(i) => i.borrow().data.get(&key.to_string()).cloned(),
            _ => None,
        }
    }

    /// Keyed write for Map and Instance
    pub fn set(&self, key: Value, value: Value) {
        match self {
            Value::Map(m) => m.borrow_mut().set(key, value),
            Value::Instance(i) => {
                i.borrow_mut().data.insert(key.to_string(), value);
            }
            _ => {}
        }
    }
}

fn elements_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
}

fn join(elements: &[Value]) -> String {
    elements.iter().map(|el| el.to_string()).collect::<Vec<_>>().join(", ")
}

/// Build a collection of the given type tag from elements, preserving
/// the left operand's type through collection algebra.
pub fn make_collection(tag: &str, elements: Vec<Value>) -> Value {
    match tag {
        STRING_TYPE => {
            let mut text = String::new();
            for element in &elements {
                match element {
                    Value::Char(c) => text.push(*c),
                    other => text.push_str(&other.to_string()),
                }
            }
            Value::string(text)
        }
        TUPLE_TYPE => Value::tuple(elements),
        _ => Value::array(elements),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s.borrow()),
            Value::Char(c) => write!(f, "{}", c),
            Value::Null => write!(f, "null"),
            Value::Tuple(t) => write!(f, "({})", join(&t.borrow())),
            Value::Array(a) => write!(f, "[{}]", join(&a.borrow())),
            Value::Map(m) => {
                let m = m.borrow();
                let mut parts = Vec::with_capacity(m.len());

                for (hash, key) in &m.keys {
                    if let Some(val) = m.values.get(hash) {
                        parts.push(format!("{}: {}", key, val));
                    }
                }

                write!(f, "[{}]", parts.join(", "))
            }
            Value::Block(_) => write!(f, "<block>"),
            Value::Function(func) => write!(f, "<function: {}>", func.pattern_string()),
            Value::Class(class) => write!(f, "{}", class.name),
            Value::Instance(i) => write!(f, "<instance of {}>", i.borrow().base.name),
            Value::Return(v) => write!(f, "{}", v),
            Value::Next => write!(f, "<next>"),
            Value::Break => write!(f, "<break>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "Number({})", n),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Str(s) => write!(f, "Str({:?})", s.borrow()),
            Value::Char(c) => write!(f, "Char({:?})", c),
            Value::Null => write!(f, "Null"),
            Value::Tuple(t) => write!(f, "Tuple({:?})", t.borrow()),
            Value::Array(a) => write!(f, "Array({:?})", a.borrow()),
            Value::Map(m) => write!(f, "Map({} entries)", m.borrow().len()),
            Value::Block(b) => write!(f, "Block({} params)", b.params.len()),
            Value::Function(func) => write!(f, "Function({})", func.pattern_string()),
            Value::Class(class) => write!(f, "Class({})", class.name),
            Value::Instance(i) => {
                let i = i.borrow();
                write!(f, "Instance({}, {} fields)", i.base.name, i.data.len())
            }
            Value::Return(v) => write!(f, "Return({:?})", v),
            Value::Next => write!(f, "Next"),
            Value::Break => write!(f, "Break"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_never_crosses_variants() {
        assert!(!Value::Number(3.0).equals(&Value::Char('3')));
        assert!(!Value::Number(0.0).equals(&Value::Boolean(false)));
        assert!(!Value::string("1").equals(&Value::Number(1.0)));
    }

    #[test]
    fn hash_includes_type_tag() {
        assert_eq!(Value::Number(3.0).hash_key().unwrap(), "number 3");
        assert_eq!(Value::Char('3').hash_key().unwrap(), "char 3");
        assert!(Value::array(vec![]).hash_key().is_none());
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(2.5).is_truthy());
        assert!(!Value::array(vec![]).is_truthy());
        assert!(Value::array(vec![Value::Null]).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("x").is_truthy());
    }

    #[test]
    fn map_twin_tables_stay_aligned() {
        let mut map = MapData::new();
        map.set(Value::string("x"), Value::Number(1.0));
        map.set(Value::Number(3.0), Value::Number(2.0));
        map.set(Value::string("x"), Value::Number(9.0));

        assert_eq!(map.len(), 2);
        assert_eq!(map.keys.len(), map.values.len());
        assert!(map.get(&Value::string("x")).unwrap().equals(&Value::Number(9.0)));
        assert!(map.get(&Value::Number(3.0)).unwrap().equals(&Value::Number(2.0)));
        assert!(map.get(&Value::Char('3')).is_none());
    }

    #[test]
    fn out_of_range_writes_are_no_ops() {
        let arr = Value::array(vec![Value::Number(1.0)]);
        arr.set_index(5, Value::Number(9.0));
        assert!(arr.equals(&Value::array(vec![Value::Number(1.0)])));

        let s = Value::string("abc");
        s.set_index(1, Value::Char('z'));
        assert!(s.equals(&Value::string("azc")));
        s.set_index(10, Value::Char('q'));
        assert!(s.equals(&Value::string("azc")));
    }

    #[test]
    fn string_is_a_collection_of_chars() {
        let s = Value::string("abc");
        assert!(s.get_index(1).unwrap().equals(&Value::Char('b')));
        assert!(s.get_index(9).is_none());
        assert_eq!(s.elements().unwrap().len(), 3);
    }

    #[test]
    fn instances_read_and_write_fields() {
        let class = Rc::new(Class { name: "Point".into(), parent: None, methods: vec![] });
        let point = Value::instance(class);

        point.set(Value::string("x"), Value::Number(4.0));
        assert!(point.get(&Value::string("x")).unwrap().equals(&Value::Number(4.0)));
        assert!(point.get(&Value::string("y")).is_none());
    }
}
