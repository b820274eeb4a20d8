use colored::*;
use std::io::{self, Write};

use super::instruction::OpCode;
use super::value::Value;
use super::{CallFrame, Result, VMError};
use crate::compiler::Compiler;
use crate::debug::{self, TRACE_EXECUTION_INSTR, TRACE_EXECUTION_STACK};
use crate::memory::{
    BoundMethod, Class, Closure, Gc, Instance, NativeFn, NativeFunction, Object, Upvalue, GC,
};

/// Deepest call nesting allowed before "Stack overflow.".
const FRAMES_MAX: usize = 64;

/// The interpreter. Owns the whole runtime context (heap, stacks, globals)
/// and the stream `print` writes to.
pub struct VM {
    gc: GC,
    output: Box<dyn Write>,
}

impl VM {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Builds a VM whose `print` output goes to `output` instead of stdout.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut vm = Self {
            gc: GC::new(),
            output,
        };
        vm.bootstrap();
        vm
    }

    /// Tears the runtime down and builds a fresh context, dropping every
    /// live object. A fixed program produces identical output before and
    /// after a reset.
    pub fn reset(&mut self) {
        self.gc = GC::new();
        self.bootstrap();
    }

    fn bootstrap(&mut self) {
        let init = self.gc.track_string("init".to_owned());
        self.gc.init_string = Some(init);
        self.define_native("clock", native_clock);
    }

    /// Registers a host function under `name`.
    pub fn define_native(&mut self, name: &str, native_fn: NativeFunction) {
        let name_obj = self.gc.track_string(name.to_owned());
        // Keep the pieces reachable until the globals table refers to them.
        self.gc.stack.push(Value::Object(name_obj));
        let native = self.gc.track_native(NativeFn::new(name_obj, native_fn));
        self.gc.stack.push(Value::Object(native));

        self.gc.globals.set(name_obj, Value::Object(native));

        self.gc.stack.pop();
        self.gc.stack.pop();
    }

    /// Compiles and runs one source. Compile failures leave the runtime
    /// untouched; runtime failures reset the value and frame stacks so the
    /// VM stays usable.
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let compiled = {
            let compiler = Compiler::new(source, &mut self.gc);
            compiler.compile()
        };
        let function = match compiled {
            Ok(function) => function,
            Err(err) => {
                self.gc.functions.clear();
                self.gc.stack.clear();
                return Err(err.into());
            }
        };
        self.interpret_function(function)
    }

    fn interpret_function(&mut self, function: Gc<Object>) -> Result<()> {
        // Wrap the script in a closure; the function stays reachable on the
        // stack while the closure is allocated.
        self.gc.stack.push(Value::Object(function));
        let closure = self.gc.track_closure(Closure::new(function));
        self.gc.stack.pop();
        self.gc.stack.push(Value::Object(closure));

        self.call_value(Value::Object(closure), 0)?;

        if let Err(err) = self.run() {
            self.report_runtime_error(&err);
            self.gc.stack.clear();
            self.gc.call_frames.clear();
            self.gc.open_upvalues.clear();
            return Err(err);
        }
        Ok(())
    }

    fn report_runtime_error(&self, err: &VMError) {
        eprintln!("{} {}", "Runtime error:".red(), err);
        // Unwind the trace newest frame first.
        for frame in self.gc.call_frames.iter().rev() {
            eprintln!(
                "[line {}] in {}",
                frame.line(),
                frame.function().function_name()
            );
        }
    }

    fn run(&mut self) -> Result<()> {
        let mut frame = self.gc.call_frames.pop().ok_or(VMError::NoCallFrame)?;
        let result = self.dispatch(&mut frame);
        if result.is_err() {
            // Reinstate the active frame so the stack trace includes it.
            self.gc.call_frames.push(frame);
        }
        result
    }

    fn dispatch(&mut self, frame: &mut CallFrame) -> Result<()> {
        while frame.ip < frame.code().len() {
            if TRACE_EXECUTION_STACK {
                let entries: Vec<String> = self
                    .gc
                    .stack
                    .iter()
                    .map(|value| format!("[{}]", value))
                    .collect();
                println!("{}\t{}", "[STACK]".yellow(), entries.join(" "));
            }
            if TRACE_EXECUTION_INSTR {
                let (text, _) =
                    debug::disassemble_instruction(&frame.function().chunk, frame.ip);
                println!("{}\t{:04}\t{}", "[INSTR]".green(), frame.ip, text);
            }

            let instruction = OpCode::from(frame.next_instruction()?);
            match instruction {
                OpCode::Constant => {
                    let constant = frame.next_instruction_as_constant()?;
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::GetLocal => {
                    let slot = frame.next_instruction()? as usize;
                    let value = self
                        .gc
                        .stack
                        .get(frame.stack_base + slot)
                        .copied()
                        .ok_or(VMError::CorruptBytecode)?;
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = frame.next_instruction()? as usize;
                    let value = self.peek(0)?;
                    self.gc.stack[frame.stack_base + slot] = value;
                }
                OpCode::GetGlobal => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    match self.gc.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(VMError::UndefinedVariable(
                                name.as_string().as_str().to_owned(),
                            ))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    let value = self.peek(0)?;
                    self.gc.globals.set(name, value);
                    self.pop()?;
                }
                OpCode::SetGlobal => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    let value = self.peek(0)?;
                    if self.gc.globals.set(name, value) {
                        // Assignment must not create a global implicitly.
                        self.gc.globals.remove(name);
                        return Err(VMError::UndefinedVariable(
                            name.as_string().as_str().to_owned(),
                        ));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = frame.next_instruction()? as usize;
                    let upvalue = *frame
                        .closure
                        .as_closure()
                        .upvalues
                        .get(slot)
                        .ok_or(VMError::CorruptBytecode)?;
                    let value = upvalue.as_upvalue().get(&self.gc);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = frame.next_instruction()? as usize;
                    let value = self.peek(0)?;
                    let mut upvalue = *frame
                        .closure
                        .as_closure()
                        .upvalues
                        .get(slot)
                        .ok_or(VMError::CorruptBytecode)?;
                    let is_open = matches!(upvalue.as_upvalue(), Upvalue::Open(_));
                    if is_open {
                        let slot = upvalue.as_upvalue().as_open();
                        self.gc.stack[slot] = value;
                    } else {
                        upvalue.as_upvalue_mut().close(value);
                    }
                }
                OpCode::GetProperty => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    // Verify the receiver is an instance before narrowing.
                    let receiver = self.peek(0)?;
                    let instance_obj = match receiver {
                        Value::Object(obj) if obj.is_instance() => obj,
                        _ => return Err(VMError::OnlyInstancesHaveProperties),
                    };
                    if let Some(value) = instance_obj.as_instance().fields.get(name) {
                        self.pop()?;
                        self.push(value);
                    } else {
                        let class = instance_obj.as_instance().class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    // Stack: [.., receiver, value]. Verify the receiver
                    // before narrowing.
                    let receiver = self.peek(1)?;
                    let mut instance_obj = match receiver {
                        Value::Object(obj) if obj.is_instance() => obj,
                        _ => return Err(VMError::OnlyInstancesHaveFields),
                    };
                    let value = self.peek(0)?;
                    instance_obj.as_instance_mut().fields.set(name, value);

                    // The assignment expression evaluates to the value.
                    let value = self.pop()?;
                    self.pop()?;
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    let superclass = self.pop()?.as_object();
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.push(Value::Bool(lhs.equals(&rhs)));
                }
                OpCode::Greater => self.op_compare(|lhs, rhs| lhs > rhs)?,
                OpCode::Less => self.op_compare(|lhs, rhs| lhs < rhs)?,
                OpCode::Add => {
                    let rhs = self.peek(0)?;
                    let lhs = self.peek(1)?;
                    match (lhs, rhs) {
                        (Value::Number(lhs), Value::Number(rhs)) => {
                            self.pop()?;
                            self.pop()?;
                            self.push(Value::Number(lhs + rhs));
                        }
                        (Value::Object(lhs), Value::Object(rhs))
                            if lhs.is_string() && rhs.is_string() =>
                        {
                            // Both operands stay on the stack until the
                            // result is interned.
                            let mut chars = String::with_capacity(
                                lhs.as_string().len() + rhs.as_string().len(),
                            );
                            chars.push_str(lhs.as_string().as_str());
                            chars.push_str(rhs.as_string().as_str());
                            let result = self.gc.track_string(chars);
                            self.pop()?;
                            self.pop()?;
                            self.push(Value::Object(result));
                        }
                        _ => return Err(VMError::AddOperands),
                    }
                }
                OpCode::Subtract => self.op_binary(|lhs, rhs| lhs - rhs)?,
                OpCode::Multiply => self.op_binary(|lhs, rhs| lhs * rhs)?,
                OpCode::Divide => self.op_binary(|lhs, rhs| lhs / rhs)?,
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(v) => self.push(Value::Number(-v)),
                        _ => return Err(VMError::OperandMustBeNumber),
                    }
                }
                OpCode::Print => {
                    let value = self.pop()?;
                    writeln!(self.output, "{}", value)?;
                }
                OpCode::Jump => {
                    let offset = frame.next_instruction_as_jump()?;
                    frame.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = frame.next_instruction_as_jump()?;
                    // The condition stays on the stack; the compiler emits
                    // the pop on both branches.
                    if self.peek(0)?.is_falsey() {
                        frame.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = frame.next_instruction_as_jump()?;
                    frame.ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = frame.next_instruction()? as usize;
                    let callee = self.peek(arg_count)?;
                    self.gc.call_frames.push(frame.clone());
                    let result = self.call_value(callee, arg_count);
                    *frame = self.gc.call_frames.pop().ok_or(VMError::NoCallFrame)?;
                    result?;
                }
                OpCode::Invoke => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    let arg_count = frame.next_instruction()? as usize;
                    self.gc.call_frames.push(frame.clone());
                    let result = self.invoke(name, arg_count);
                    *frame = self.gc.call_frames.pop().ok_or(VMError::NoCallFrame)?;
                    result?;
                }
                OpCode::SuperInvoke => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    let arg_count = frame.next_instruction()? as usize;
                    let superclass = self.pop()?.as_object();
                    self.gc.call_frames.push(frame.clone());
                    let result = self.invoke_from_class(superclass, name, arg_count);
                    *frame = self.gc.call_frames.pop().ok_or(VMError::NoCallFrame)?;
                    result?;
                }
                OpCode::Closure => {
                    let function = frame.next_instruction_as_constant()?.as_object();
                    let mut closure = self.gc.track_closure(Closure::new(function));
                    // Root the closure before captures can allocate.
                    self.push(Value::Object(closure));

                    let upvalue_count = closure.as_closure().upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = frame.next_instruction()? == 1;
                        let index = frame.next_instruction()? as usize;
                        let upvalue = if is_local {
                            self.capture_upvalue(frame.stack_base + index)
                        } else {
                            *frame
                                .closure
                                .as_closure()
                                .upvalues
                                .get(index)
                                .ok_or(VMError::CorruptBytecode)?
                        };
                        closure.as_closure_mut().upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.gc.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    self.close_upvalues(frame.stack_base);

                    self.gc.stack.truncate(frame.stack_base);
                    if self.gc.call_frames.is_empty() {
                        // Returning from the script ends the program.
                        return Ok(());
                    }
                    *frame = self.gc.call_frames.pop().ok_or(VMError::NoCallFrame)?;
                    self.push(result);
                }
                OpCode::Class => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    let class = self.gc.track_class(Class::new(name));
                    self.push(Value::Object(class));
                }
                OpCode::Inherit => {
                    // Stack: [.., superclass, subclass].
                    let superclass_obj = match self.peek(1)? {
                        Value::Object(obj) if obj.is_class() => obj,
                        _ => return Err(VMError::SuperclassMustBeClass),
                    };
                    let mut subclass_obj = self.peek(0)?.as_object();
                    superclass_obj
                        .as_class()
                        .methods
                        .add_all(&mut subclass_obj.as_class_mut().methods);
                    self.pop()?;
                }
                OpCode::Method => {
                    let name = frame.next_instruction_as_constant()?.as_object();
                    // Stack: [.., class, method closure].
                    let method = self.peek(0)?;
                    let mut class_obj = self.peek(1)?.as_object();
                    class_obj.as_class_mut().methods.set(name, method);
                    self.pop()?;
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, value: Value) {
        self.gc.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.gc.stack.pop().ok_or(VMError::EmptyStack)
    }

    fn peek(&self, distance: usize) -> Result<Value> {
        self.gc
            .stack
            .len()
            .checked_sub(1 + distance)
            .and_then(|index| self.gc.stack.get(index))
            .copied()
            .ok_or(VMError::EmptyStack)
    }

    fn op_binary(&mut self, op: fn(f64, f64) -> f64) -> Result<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.push(Value::Number(op(lhs, rhs)));
                Ok(())
            }
            _ => Err(VMError::OperandsMustBeNumbers),
        }
    }

    fn op_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.push(Value::Bool(op(lhs, rhs)));
                Ok(())
            }
            _ => Err(VMError::OperandsMustBeNumbers),
        }
    }

    /// Dispatches a call on any callee value.
    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<()> {
        let object = match callee {
            Value::Object(object) => object,
            _ => return Err(VMError::NotCallable),
        };
        match object.as_ref() {
            Object::Closure(_) => self.call(object, arg_count),
            Object::Native(native_fn) => {
                let fun = native_fn.fun;
                let start = self.gc.stack.len() - arg_count;
                let result = fun(arg_count, &self.gc.stack[start..]);
                // Drop the arguments and the callee, then push the result.
                self.gc.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Object::Class(_) => {
                let instance = self.gc.track_instance(Instance::new(object));
                let slot = self.gc.stack.len() - arg_count - 1;
                self.gc.stack[slot] = Value::Object(instance);

                let initializer = self
                    .gc
                    .init_string
                    .and_then(|init| object.as_class().methods.get(init));
                if let Some(initializer) = initializer {
                    self.call(initializer.as_object(), arg_count)
                } else if arg_count != 0 {
                    Err(VMError::ArityMismatch {
                        expected: 0,
                        got: arg_count,
                    })
                } else {
                    Ok(())
                }
            }
            Object::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let slot = self.gc.stack.len() - arg_count - 1;
                self.gc.stack[slot] = receiver;
                self.call(method, arg_count)
            }
            _ => Err(VMError::NotCallable),
        }
    }

    /// Pushes a frame for a closure call after checking arity and frame
    /// depth. The callee and its arguments are already in place on the
    /// stack; the callee slot becomes local 0.
    fn call(&mut self, closure: Gc<Object>, arg_count: usize) -> Result<()> {
        let arity = closure.as_closure().function.as_function().arity;
        if arg_count != arity {
            return Err(VMError::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }
        if self.gc.call_frames.len() >= FRAMES_MAX {
            return Err(VMError::StackOverflow);
        }

        let stack_base = self.gc.stack.len() - arg_count - 1;
        self.gc.call_frames.push(CallFrame::new(closure, stack_base));
        Ok(())
    }

    /// `receiver.name(args)` without materializing a bound method: a field
    /// with that name shadows the method and may hold any callable.
    fn invoke(&mut self, name: Gc<Object>, arg_count: usize) -> Result<()> {
        let receiver = self.peek(arg_count)?;
        let instance_obj = match receiver {
            Value::Object(obj) if obj.is_instance() => obj,
            _ => return Err(VMError::OnlyInstancesHaveMethods),
        };

        if let Some(field) = instance_obj.as_instance().fields.get(name) {
            let slot = self.gc.stack.len() - arg_count - 1;
            self.gc.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        self.invoke_from_class(instance_obj.as_instance().class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: Gc<Object>,
        name: Gc<Object>,
        arg_count: usize,
    ) -> Result<()> {
        let method = class.as_class().methods.get(name).ok_or_else(|| {
            VMError::UndefinedProperty(name.as_string().as_str().to_owned())
        })?;
        self.call(method.as_object(), arg_count)
    }

    /// Reads a method from `class` and leaves it bound to the receiver on
    /// top of the stack.
    fn bind_method(&mut self, class: Gc<Object>, name: Gc<Object>) -> Result<()> {
        let method = class.as_class().methods.get(name).ok_or_else(|| {
            VMError::UndefinedProperty(name.as_string().as_str().to_owned())
        })?;

        // The receiver stays on the stack while the bound method is
        // allocated.
        let receiver = self.peek(0)?;
        let bound = self
            .gc
            .track_bound_method(BoundMethod::new(receiver, method.as_object()));
        self.pop()?;
        self.push(Value::Object(bound));
        Ok(())
    }

    /// Finds or creates the upvalue for a stack slot. The open list stays
    /// sorted by ascending slot, and a slot is captured at most once.
    fn capture_upvalue(&mut self, slot: usize) -> Gc<Object> {
        let mut insert_at = 0;
        for (i, upvalue) in self.gc.open_upvalues.iter().enumerate().rev() {
            let open_slot = upvalue.as_upvalue().as_open();
            if open_slot == slot {
                return *upvalue;
            }
            if open_slot < slot {
                insert_at = i + 1;
                break;
            }
        }

        let upvalue = self.gc.track_upvalue(Upvalue::new(slot));
        self.gc.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `last`, moving the stack value
    /// into the upvalue itself.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(upvalue) = self.gc.open_upvalues.last().copied() {
            let slot = upvalue.as_upvalue().as_open();
            if slot < last {
                break;
            }
            let value = self.gc.stack[slot];
            let mut upvalue = upvalue;
            upvalue.as_upvalue_mut().close(value);
            self.gc.open_upvalues.pop();
        }
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

fn native_clock(_arg_count: usize, _args: &[Value]) -> Value {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(now.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Cloneable sink so a test can keep reading what the VM printed.
    #[derive(Clone, Default)]
    struct SharedOutput(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedOutput {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.borrow().clone())
                .expect("output is utf-8")
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    fn capture_vm() -> (VM, SharedOutput) {
        let output = SharedOutput::default();
        let vm = VM::with_output(Box::new(output.clone()));
        (vm, output)
    }

    fn run(source: &str) -> Result<()> {
        let (mut vm, _output) = capture_vm();
        vm.interpret(source)
    }

    fn run_expect(source: &str, expected: &[&str]) {
        let (mut vm, output) = capture_vm();
        vm.interpret(source).expect("program should run");
        assert_eq!(output.lines(), expected);
    }

    #[test]
    fn arithmetic_precedence() {
        run_expect("print 1 + 2 * 3;", &["7"]);
        run_expect("print (-1 + 2) * 3 - -4;", &["7"]);
        run_expect("print 3 + 4 / 2;", &["5"]);
    }

    #[test]
    fn comparisons_and_equality() {
        run_expect("print 1 < 2;", &["true"]);
        run_expect("print 2 <= 2;", &["true"]);
        run_expect("print 3 > 4;", &["false"]);
        run_expect("print 4 >= 4;", &["true"]);
        run_expect("print 1 == 2;", &["false"]);
        run_expect("print \"a\" != \"b\";", &["true"]);
        run_expect("print !(5 - 4 > 3 * 2 == !nil);", &["true"]);
    }

    #[test]
    fn values_of_different_kinds_compare_unequal() {
        run_expect("print nil == 0;", &["false"]);
        run_expect("print false == nil;", &["false"]);
        run_expect("print nil == nil;", &["true"]);
    }

    #[test]
    fn truthiness_in_not() {
        run_expect("print !nil;", &["true"]);
        run_expect("print !0;", &["false"]);
        run_expect("print !\"\";", &["false"]);
    }

    #[test]
    fn string_concatenation() {
        run_expect("print \"st\" + \"ri\" + \"ng\";", &["string"]);
    }

    #[test]
    fn concatenated_strings_are_interned() {
        run_expect("print \"ab\" + \"cd\" == \"abcd\";", &["true"]);
    }

    #[test]
    fn add_type_mismatch_is_an_error() {
        assert!(matches!(run("print 1 + \"one\";"), Err(VMError::AddOperands)));
        assert!(matches!(run("print -\"x\";"), Err(VMError::OperandMustBeNumber)));
        assert!(matches!(
            run("print 1 < \"two\";"),
            Err(VMError::OperandsMustBeNumbers)
        ));
    }

    #[test]
    fn globals_define_read_assign() {
        let source = r#"
        var beverage = "cafe au lait";
        var breakfast = "beignets with " + beverage;
        print breakfast;
        breakfast = "muffins";
        print breakfast;
        "#;
        run_expect(source, &["beignets with cafe au lait", "muffins"]);
    }

    #[test]
    fn undefined_variable_errors() {
        assert!(matches!(
            run("print missing;"),
            Err(VMError::UndefinedVariable(name)) if name == "missing"
        ));
        assert!(matches!(
            run("missing = 1;"),
            Err(VMError::UndefinedVariable(_))
        ));
    }

    #[test]
    fn locals_shadow_and_unwind() {
        let source = r#"
        var a = "global";
        {
            var a = "outer";
            {
                var a = "inner";
                print a;
            }
            print a;
        }
        print a;
        "#;
        run_expect(source, &["inner", "outer", "global"]);
    }

    #[test]
    fn if_else_branches() {
        let source = r#"
        var a = 1;
        var b = 1;
        if (a == 1) { a = 10; } else { a = 20; }
        if (b == 2) { b = 100; } else { b = 200; }
        print a;
        print b;
        "#;
        run_expect(source, &["10", "200"]);
    }

    #[test]
    fn logical_operators_short_circuit() {
        let source = r#"
        var a = true and false;
        var b = true or false;
        print a;
        print b;
        print nil or "fallback";
        print nil and "unreached";
        "#;
        run_expect(source, &["false", "true", "fallback", "nil"]);
    }

    #[test]
    fn while_loop() {
        let source = r#"
        var a = 0;
        while (a < 10) { a = a + 1; }
        print a;
        "#;
        run_expect(source, &["10"]);
    }

    #[test]
    fn for_loop_sums() {
        run_expect(
            "var s = 0; for (var i = 1; i <= 4; i = i + 1) s = s + i; print s;",
            &["10"],
        );
    }

    #[test]
    fn for_loop_with_partial_clauses() {
        let source = r#"
        var i = 0;
        var done = false;
        for (; !done;) {
            i = i + 1;
            if (i >= 3) { done = true; }
        }
        print i;
        "#;
        run_expect(source, &["3"]);
    }

    #[test]
    fn functions_and_returns() {
        let source = r#"
        fun add(a, b) { return a + b; }
        print add(1, 2);
        fun nothing() {}
        print nothing();
        "#;
        run_expect(source, &["3", "nil"]);
    }

    #[test]
    fn recursion() {
        let source = r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 2) + fib(n - 1);
        }
        print fib(10);
        "#;
        run_expect(source, &["55"]);
    }

    #[test]
    fn native_clock_is_callable() {
        run_expect("print clock() >= 0;", &["true"]);
    }

    #[test]
    fn custom_native_function() {
        let (mut vm, output) = capture_vm();
        vm.define_native("seven", |_argc, _args| Value::Number(7.0));
        vm.interpret("print seven();").expect("program should run");
        assert_eq!(output.lines(), vec!["7"]);
    }

    #[test]
    fn closure_counter() {
        let source = r#"
        fun make() {
            var x = 0;
            fun inc() { x = x + 1; return x; }
            return inc;
        }
        var c = make();
        print c();
        print c();
        print c();
        "#;
        run_expect(source, &["1", "2", "3"]);
    }

    #[test]
    fn closures_capture_independent_state() {
        let source = r#"
        fun makeClosure(value) {
            fun closure() { print value; }
            return closure;
        }
        var doughnut = makeClosure("doughnut");
        var bagel = makeClosure("bagel");
        doughnut();
        bagel();
        "#;
        run_expect(source, &["doughnut", "bagel"]);
    }

    #[test]
    fn closures_share_one_upvalue() {
        let source = r#"
        var setter;
        var getter;
        fun make() {
            var x = 1;
            fun set(v) { x = v; }
            fun get() { return x; }
            setter = set;
            getter = get;
        }
        make();
        setter(42);
        print getter();
        "#;
        run_expect(source, &["42"]);
    }

    #[test]
    fn upvalue_closes_when_scope_ends() {
        let source = r#"
        var f;
        {
            var a = "captured";
            fun g() { print a; }
            f = g;
        }
        f();
        "#;
        run_expect(source, &["captured"]);
    }

    #[test]
    fn nested_closures_reach_through_middle() {
        let source = r#"
        fun outer() {
            var x = "value";
            fun middle() {
                fun inner() { print x; }
                return inner;
            }
            return middle;
        }
        var mid = outer();
        var inner = mid();
        inner();
        "#;
        run_expect(source, &["value"]);
    }

    #[test]
    fn class_with_fields() {
        let source = r#"
        class Pair {}
        var pair = Pair();
        pair.first = 1;
        pair.second = 2;
        print pair.first + pair.second;
        "#;
        run_expect(source, &["3"]);
    }

    #[test]
    fn set_property_evaluates_to_value() {
        let source = r#"
        class Box {}
        var box = Box();
        print box.content = "cargo";
        "#;
        run_expect(source, &["cargo"]);
    }

    #[test]
    fn class_initializer_and_method() {
        let source = r#"
        class Greeter {
            init(n) { this.n = n; }
            hi() { print "hi " + this.n; }
        }
        Greeter("world").hi();
        "#;
        run_expect(source, &["hi world"]);
    }

    #[test]
    fn initializer_returns_the_instance() {
        let source = r#"
        class Point {
            init(x) { this.x = x; }
        }
        var p = Point(4);
        print p.x;
        "#;
        run_expect(source, &["4"]);
    }

    #[test]
    fn calling_class_without_initializer_rejects_arguments() {
        assert!(matches!(
            run("class Empty {} Empty(1);"),
            Err(VMError::ArityMismatch {
                expected: 0,
                got: 1
            })
        ));
    }

    #[test]
    fn initializer_arity_is_checked() {
        assert!(matches!(
            run("class Point { init(x, y) {} } Point(1);"),
            Err(VMError::ArityMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn bound_method_carries_receiver() {
        let source = r#"
        class Speaker {
            init(word) { this.word = word; }
            say() { print this.word; }
        }
        var method = Speaker("bound").say;
        method();
        "#;
        run_expect(source, &["bound"]);
    }

    #[test]
    fn field_shadows_method_on_invoke() {
        let source = r#"
        fun shout() { print "field wins"; }
        class Thing {
            act() { print "method"; }
        }
        var thing = Thing();
        thing.act = shout;
        thing.act();
        "#;
        run_expect(source, &["field wins"]);
    }

    #[test]
    fn single_inheritance_with_super() {
        let source = r#"
        class A { greet() { print "A"; } }
        class B < A { greet() { super.greet(); print "B"; } }
        B().greet();
        "#;
        run_expect(source, &["A", "B"]);
    }

    #[test]
    fn inherited_methods_are_copied_down() {
        let source = r#"
        class Base { ping() { print "pong"; } }
        class Derived < Base {}
        Derived().ping();
        "#;
        run_expect(source, &["pong"]);
    }

    #[test]
    fn overriding_does_not_touch_the_parent() {
        let source = r#"
        class Base { who() { print "base"; } }
        class Derived < Base { who() { print "derived"; } }
        Base().who();
        Derived().who();
        "#;
        run_expect(source, &["base", "derived"]);
    }

    #[test]
    fn superclass_must_be_a_class() {
        assert!(matches!(
            run("var NotAClass = 1; class Sub < NotAClass {}"),
            Err(VMError::SuperclassMustBeClass)
        ));
    }

    #[test]
    fn property_access_on_non_instances_errors() {
        assert!(matches!(
            run("var x = 1; print x.field;"),
            Err(VMError::OnlyInstancesHaveProperties)
        ));
        assert!(matches!(
            run("var x = 1; x.field = 2;"),
            Err(VMError::OnlyInstancesHaveFields)
        ));
        assert!(matches!(
            run("var x = 1; x.method();"),
            Err(VMError::OnlyInstancesHaveMethods)
        ));
    }

    #[test]
    fn undefined_property_errors() {
        assert!(matches!(
            run("class Empty {} print Empty().nope;"),
            Err(VMError::UndefinedProperty(name)) if name == "nope"
        ));
        assert!(matches!(
            run("class Empty {} Empty().nope();"),
            Err(VMError::UndefinedProperty(_))
        ));
    }

    #[test]
    fn calling_a_non_callable_errors() {
        assert!(matches!(run("var x = 1; x();"), Err(VMError::NotCallable)));
        assert!(matches!(run("true();"), Err(VMError::NotCallable)));
    }

    #[test]
    fn arity_mismatch_errors() {
        assert!(matches!(
            run("fun f(a, b) {} f(1);"),
            Err(VMError::ArityMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn frame_depth_boundary() {
        // The script frame plus 63 calls fits exactly; one more overflows.
        let ok = r#"
        fun f(n) { if (n > 0) f(n - 1); }
        f(62);
        print "survived";
        "#;
        run_expect(ok, &["survived"]);

        let too_deep = r#"
        fun f(n) { if (n > 0) f(n - 1); }
        f(63);
        "#;
        assert!(matches!(run(too_deep), Err(VMError::StackOverflow)));
    }

    #[test]
    fn unbounded_recursion_overflows() {
        assert!(matches!(
            run("fun f() { f(); } f();"),
            Err(VMError::StackOverflow)
        ));
    }

    #[test]
    fn vm_recovers_after_runtime_error() {
        let (mut vm, output) = capture_vm();
        assert!(vm.interpret("print missing;").is_err());
        vm.interpret("print \"still alive\";")
            .expect("the runtime must stay usable");
        assert_eq!(output.lines(), vec!["still alive"]);
    }

    #[test]
    fn reset_reproduces_identical_output() {
        let source = r#"
        class Counter {
            init() { this.n = 0; }
            bump() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter();
        c.bump();
        print c.bump();
        print "x" + "y";
        "#;

        let (mut vm, output) = capture_vm();
        vm.interpret(source).expect("first run");
        let first = output.lines();

        vm.reset();
        vm.interpret(source).expect("second run");
        let all = output.lines();
        assert_eq!(all.len(), first.len() * 2);
        assert_eq!(&all[first.len()..], &first[..]);
    }

    #[test]
    fn stress_gc_runs_whole_programs() {
        let source = r#"
        class Node {
            init(value) { this.value = value; this.next = nil; }
        }
        fun chain(n) {
            var head = Node("head");
            var cursor = head;
            for (var i = 0; i < n; i = i + 1) {
                cursor.next = Node("link" + "-" + "x");
                cursor = cursor.next;
            }
            return head;
        }
        var list = chain(20);
        print list.next.value;
        fun adder(a) { fun inner(b) { return a + b; } return inner; }
        print adder(1)(2);
        "#;
        let output = SharedOutput::default();
        let mut vm = VM::with_output(Box::new(output.clone()));
        vm.gc.stress = true;
        vm.interpret(source).expect("stress run should succeed");
        assert_eq!(output.lines(), vec!["link-x", "3"]);
    }

    #[test]
    fn garbage_is_collected_between_statements() {
        let source = r#"
        var kept = "kept";
        {
            var temp = kept + "!";
            print temp;
        }
        kept = "replaced";
        {
            var temp = kept + "!";
            print temp;
        }
        "#;
        let (mut vm, output) = capture_vm();
        vm.interpret(source).expect("program should run");
        let before = vm.gc.object_count();
        vm.gc.collect();
        // The intermediate concatenations are unreachable afterwards.
        assert!(vm.gc.object_count() < before);
        assert_eq!(output.lines(), vec!["kept!", "replaced!"]);
    }

    #[test]
    fn compile_errors_do_not_disturb_the_runtime() {
        let (mut vm, output) = capture_vm();
        assert!(matches!(
            vm.interpret("var = broken"),
            Err(VMError::CompileError(_))
        ));
        vm.interpret("print \"fine\";").expect("still usable");
        assert_eq!(output.lines(), vec!["fine"]);
    }
}
