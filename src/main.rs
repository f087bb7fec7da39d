use std::io::Write;

use dnx_vm::{BinaryImage, Interpreter, MapRegistry, Opcode, Value};

/// Tiny bytecode writer for assembling the demo scene
#[derive(Default)]
struct Code {
    bytes: Vec<u8>,
}

impl Code {
    fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.bytes.push(opcode as u8);
        self
    }

    fn i32(&mut self, value: i32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn f64(&mut self, value: f64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn pos(&self) -> usize {
        self.bytes.len()
    }

    /// Patch a branch operand once its target is known
    fn patch(&mut self, post_operand: usize, target: usize) {
        let rel = (target as i64 - post_operand as i64) as i32;
        self.bytes[post_operand - 4..post_operand].copy_from_slice(&rel.to_le_bytes());
    }
}

/// Assemble a small scene in memory: a greeting, a choice, and a line
/// per branch. A real host would load a compiled `.dnx` file instead.
fn demo_image() -> BinaryImage {
    let mut c = Code::default();

    // greeting with an interpolated coin count from a host call
    c.op(Opcode::CallExternal).i32(1).i32(0); // coins()
    c.op(Opcode::PushInterpolatedString).i32(0).i32(1);
    c.op(Opcode::TextRun);

    c.op(Opcode::ChoiceBegin);
    c.op(Opcode::PushString).i32(1);
    c.op(Opcode::PushDouble).f64(1.0);
    c.op(Opcode::ChoiceAdd).i32(0);
    let post_stay = c.pos();
    c.op(Opcode::PushString).i32(2);
    c.op(Opcode::PushDouble).f64(1.0);
    c.op(Opcode::ChoiceAdd).i32(0);
    let post_leave = c.pos();
    c.op(Opcode::ChoiceSelect);

    let stay = c.pos();
    c.op(Opcode::PushString).i32(3);
    c.op(Opcode::TextRun);
    c.op(Opcode::Exit);

    let leave = c.pos();
    c.op(Opcode::PushString).i32(4);
    c.op(Opcode::TextRun);
    c.op(Opcode::Exit);

    c.patch(post_stay, stay);
    c.patch(post_leave, leave);

    let mut image = BinaryImage::new();
    image.string_table = vec!["demo".to_string(), "coins".to_string()];
    image.translation_table = vec![
        "Welcome, traveller. You carry ${0} coins.".to_string(),
        "Stay a while.".to_string(),
        "Leave at once.".to_string(),
        "The fire crackles. You feel at home.".to_string(),
        "The road swallows you whole.".to_string(),
    ];
    image.translation_loaded = true;
    image.instructions = c.bytes;
    image.scenes.insert(0, vec![0]);
    image
}

fn read_choice(count: usize) -> usize {
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return 0;
        }
        match line.trim().parse::<usize>() {
            Ok(n) if n >= 1 && n <= count => return n - 1,
            _ => println!("enter a number between 1 and {}", count),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut registry = MapRegistry::new();
    registry.register("coins", |_args| Ok(Value::Int(17)));

    let mut vm = Interpreter::new(demo_image(), registry);
    vm.run_scene("demo")?;

    loop {
        vm.update()?;
        if vm.running_text() {
            println!("{}", vm.current_text());
            vm.resume();
        } else if vm.select_choice() {
            for (i, text) in vm.choices().iter().enumerate() {
                println!("  {}. {}", i + 1, text);
            }
            let picked = read_choice(vm.choices().len());
            vm.choose_choice(picked)?;
        } else if vm.scene_completed() {
            break;
        }
    }

    Ok(())
}
