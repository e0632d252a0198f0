//! Sandbox bootstrap script shared by the pool and event-loop paths.
//!
//! Both paths call [`build_bootstrap`] with the same [`CapabilitySet`] and
//! disabled-globals list, so every runtime exposes an identical surface:
//!
//! - `console.*` routed to tracing
//! - `setTimeout`/`setInterval`/`setImmediate`/`queueMicrotask` and their
//!   `clear*` counterparts, backed by a FIFO timer queue ordered by
//!   (deadline, registration order) and woken by a host sleep op
//! - one global per host capability, calling the `HostDispatcher`
//! - a frozen, non-configurable `__runbox` object with the entry points
//!   the wrapped user code calls and the integrity check
//!
//! Code-generation primitives and host escape hatches are removed and the
//! `Function`/`AsyncFunction`/`GeneratorFunction` constructor chains are
//! severed.

use serde::Serialize;

use crate::CapabilitySet;

/// Globals removed from every runtime regardless of configuration.
pub const DEFAULT_DISABLED_GLOBALS: &[&str] = &[
    "eval",
    "Deno",
    "WebAssembly",
    "SharedArrayBuffer",
    "Atomics",
    "__bootstrap",
];

/// Captures the integrity baseline. Run once after bootstrap settles.
pub const SEAL_SCRIPT: &str = "__runbox.seal();";

/// Runs the integrity check and reports it through an op.
pub const VERIFY_SCRIPT: &str = "__runbox.verify();";

#[derive(Serialize)]
struct CapabilityDecl<'a> {
    name: &'a str,
    methods: Option<&'a [String]>,
}

const BOOTSTRAP: &str = r#"((ops) => {
    "use strict";
    const {
        op_runbox_log,
        op_runbox_take_input,
        op_runbox_set_result,
        op_runbox_report_integrity,
        op_runbox_sleep,
        op_runbox_host_call,
    } = ops;

    const CAPABILITIES = __CAPABILITIES__;
    const DISABLED_GLOBALS = __DISABLED_GLOBALS__;

    // Intrinsics captured before user code can touch them.
    const apply = Reflect.apply;
    const ownKeys = Reflect.ownKeys;
    const deleteProperty = Reflect.deleteProperty;
    const defineProperty = Object.defineProperty;
    const getOwnPropertyDescriptor = Object.getOwnPropertyDescriptor;
    const getPrototypeOf = Object.getPrototypeOf;
    const isExtensible = Object.isExtensible;
    const freeze = Object.freeze;
    const objectIs = Object.is;
    const hasOwn = Object.hasOwn;
    const SetCtor = Set;
    const setAdd = Set.prototype.add;
    const setHas = Set.prototype.has;
    const jsonStringify = JSON.stringify;
    const jsonParse = JSON.parse;
    const dateNow = Date.now;
    const toString = String;
    const numberCtor = Number;
    const mathMax = Math.max;
    const mathMin = Math.min;
    const arraySplice = Array.prototype.splice;
    const arrayShift = Array.prototype.shift;
    const arrayMap = Array.prototype.map;
    const arrayJoin = Array.prototype.join;
    const promiseThen = Promise.prototype.then;
    const promiseResolve = Promise.resolve.bind(Promise);
    const promiseReject = Promise.reject.bind(Promise);
    const TypeErrorCtor = TypeError;

    const state = { pendingHostCalls: 0, usedAsync: false };

    // --- Result reporting ---

    const settle = (value) => {
        if (value === undefined) {
            op_runbox_set_result('{"missing":true}');
            return;
        }
        let json;
        try {
            json = jsonStringify(value);
        } catch (e) {
            op_runbox_set_result(jsonStringify({ unserializable: toString(e && e.message || e) }));
            return;
        }
        if (json === undefined) {
            op_runbox_set_result(jsonStringify({
                unserializable: "value of type " + typeof value + " has no JSON form",
            }));
            return;
        }
        op_runbox_set_result('{"ok":' + json + "}");
    };

    const fail = (e) => {
        let name = "Error";
        let message = "";
        let stack = null;
        try {
            if (e !== null && typeof e === "object") {
                name = toString(e.name || "Error");
                message = toString(e.message ?? "");
                stack = typeof e.stack === "string" ? e.stack : null;
            } else {
                message = toString(e);
            }
        } catch (_) {
            message = "exception could not be converted to a string";
        }
        op_runbox_set_result(jsonStringify({ error: { name, message, stack } }));
    };

    const begin = () => jsonParse(op_runbox_take_input());

    const runSync = (fn) => {
        const env = begin();
        let value;
        try {
            value = fn(env.input, env.executionId);
        } catch (e) {
            fail(e);
            return;
        }
        let thenable = false;
        try {
            thenable = value !== null
                && (typeof value === "object" || typeof value === "function")
                && typeof value.then === "function";
        } catch (e) {
            fail(e);
            return;
        }
        if (thenable) {
            state.usedAsync = true;
            apply(promiseThen, promiseResolve(value), [settle, fail]);
            return;
        }
        settle(value);
    };

    const runAsync = (fn) => {
        const env = begin();
        let promise;
        try {
            promise = fn(env.input, env.executionId);
        } catch (e) {
            fail(e);
            return;
        }
        apply(promiseThen, promiseResolve(promise), [settle, fail]);
    };

    // --- Console ---

    const formatArg = (a) => {
        if (typeof a === "string") return a;
        try {
            const json = jsonStringify(a);
            return json === undefined ? toString(a) : json;
        } catch (_) {
            return toString(a);
        }
    };
    const logAt = (level) => (...args) => {
        op_runbox_log(level, apply(arrayJoin, apply(arrayMap, args, [formatArg]), [" "]));
    };
    const sandboxConsole = freeze({
        log: logAt("info"),
        info: logAt("info"),
        warn: logAt("warn"),
        error: logAt("error"),
        debug: logAt("debug"),
        trace: logAt("debug"),
    });

    // --- Timers ---

    const MAX_DELAY = 2147483647;
    const timers = { __proto__: null };
    const timerQueue = [];
    let liveTimers = 0;
    let nextTimerId = 1;
    let timerSeq = 0;
    let armedAt = Infinity;
    let firing = false;

    const insertTimer = (entry) => {
        let i = timerQueue.length;
        while (i > 0) {
            const prev = timerQueue[i - 1];
            if (prev.when < entry.when || (prev.when === entry.when && prev.seq < entry.seq)) break;
            i -= 1;
        }
        apply(arraySplice, timerQueue, [i, 0, entry]);
    };

    const nextLive = () => {
        while (timerQueue.length > 0 && timerQueue[0].cancelled) {
            apply(arrayShift, timerQueue, []);
        }
        return timerQueue[0];
    };

    const onWake = () => {
        armedAt = Infinity;
        fire();
    };

    const arm = () => {
        const head = nextLive();
        if (head === undefined || head.when >= armedAt) return;
        armedAt = head.when;
        const delay = mathMin(MAX_DELAY, mathMax(0, head.when - dateNow()));
        apply(promiseThen, op_runbox_sleep(delay), [onWake]);
    };

    const fire = async () => {
        if (firing) return;
        firing = true;
        try {
            for (;;) {
                const head = nextLive();
                if (head === undefined || head.when > dateNow()) break;
                apply(arrayShift, timerQueue, []);
                if (head.interval >= 0) {
                    head.when = dateNow() + head.interval;
                    head.seq = timerSeq++;
                    insertTimer(head);
                } else {
                    delete timers[head.id];
                    liveTimers -= 1;
                }
                try {
                    apply(head.callback, globalThis, head.args);
                } catch (e) {
                    fail(e);
                }
                // Let microtasks queued by the callback run before the next one.
                await undefined;
            }
        } finally {
            firing = false;
            arm();
        }
    };

    const schedule = (callback, delay, args, repeat) => {
        if (typeof callback !== "function") {
            throw new TypeErrorCtor("timer callback must be a function");
        }
        let ms = numberCtor(delay);
        if (!(ms >= 0)) ms = 0;
        ms = mathMin(ms, MAX_DELAY);
        if (repeat) ms = mathMax(ms, 1);
        const id = nextTimerId++;
        const entry = {
            id,
            when: dateNow() + ms,
            seq: timerSeq++,
            callback,
            args,
            interval: repeat ? ms : -1,
            cancelled: false,
        };
        timers[id] = entry;
        liveTimers += 1;
        insertTimer(entry);
        arm();
        return id;
    };

    const clearTimer = (id) => {
        const entry = timers[id];
        if (entry === undefined) return;
        entry.cancelled = true;
        delete timers[id];
        liveTimers -= 1;
    };

    const queueMicrotask = (callback) => {
        if (typeof callback !== "function") {
            throw new TypeErrorCtor("queueMicrotask callback must be a function");
        }
        apply(promiseThen, promiseResolve(undefined), [() => {
            try {
                callback();
            } catch (e) {
                fail(e);
            }
        }]);
    };

    // --- Host capabilities ---

    const hostCall = (capability, method, args) => {
        let argsJson;
        try {
            argsJson = jsonStringify(args);
        } catch (e) {
            return promiseReject(e);
        }
        state.pendingHostCalls += 1;
        const done = () => {
            state.pendingHostCalls -= 1;
        };
        return apply(promiseThen, op_runbox_host_call(capability, method, argsJson ?? "[]"), [
            (json) => {
                done();
                return jsonParse(json);
            },
            (e) => {
                done();
                throw e;
            },
        ]);
    };

    const install = (name, value, writable) => {
        deleteProperty(globalThis, name);
        defineProperty(globalThis, name, {
            value,
            writable,
            configurable: writable,
            enumerable: false,
        });
    };

    for (const cap of CAPABILITIES) {
        let value;
        if (cap.methods === null) {
            value = (...args) => hostCall(cap.name, "call", args);
        } else {
            const ns = {};
            for (const method of cap.methods) {
                ns[method] = (...args) => hostCall(cap.name, method, args);
            }
            value = freeze(ns);
        }
        install(cap.name, value, false);
    }

    install("console", sandboxConsole, true);
    install("setTimeout", (cb, ms, ...args) => schedule(cb, ms, args, false), true);
    install("setInterval", (cb, ms, ...args) => schedule(cb, ms, args, true), true);
    install("setImmediate", (cb, ...args) => schedule(cb, 0, args, false), true);
    install("clearTimeout", clearTimer, true);
    install("clearInterval", clearTimer, true);
    install("clearImmediate", clearTimer, true);
    install("queueMicrotask", queueMicrotask, true);

    // --- Integrity baseline ---

    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    const AsyncGeneratorFunction = (async function* () {}).constructor;

    const isObjectLike = (v) => v !== null && (typeof v === "object" || typeof v === "function");
    const field = (d, k) => (hasOwn(d, k) ? d[k] : undefined);

    const record = (d) => ({
        __proto__: null,
        value: field(d, "value"),
        get: field(d, "get"),
        set: field(d, "set"),
        writable: field(d, "writable"),
        configurable: field(d, "configurable"),
        enumerable: field(d, "enumerable"),
    });

    const sameDescriptor = (a, d) => d !== undefined
        && objectIs(a.value, field(d, "value"))
        && objectIs(a.get, field(d, "get"))
        && objectIs(a.set, field(d, "set"))
        && a.writable === field(d, "writable")
        && a.configurable === field(d, "configurable")
        && a.enumerable === field(d, "enumerable");

    const unchanged = (snap) => {
        const obj = snap.obj;
        if (!objectIs(getPrototypeOf(obj), snap.proto)) return false;
        if (isExtensible(obj) !== snap.extensible) return false;
        const keys = ownKeys(obj);
        if (keys.length !== snap.keys.length) return false;
        for (let i = 0; i < snap.keys.length; i++) {
            if (!sameDescriptor(snap.descriptors[i], getOwnPropertyDescriptor(obj, snap.keys[i]))) {
                return false;
            }
        }
        return true;
    };

    // Intrinsics no global property leads to.
    const hiddenRoots = () => {
        const arrayIter = [][Symbol.iterator]();
        const roots = [
            AsyncFunction,
            GeneratorFunction,
            AsyncGeneratorFunction,
            getPrototypeOf(arrayIter),
            getPrototypeOf(new Map()[Symbol.iterator]()),
            getPrototypeOf(new Set()[Symbol.iterator]()),
            getPrototypeOf(""[Symbol.iterator]()),
            getPrototypeOf(/x/[Symbol.matchAll]("")),
        ];
        if (typeof arrayIter.map === "function") {
            roots[roots.length] = getPrototypeOf(apply(arrayIter.map, arrayIter, [(x) => x]));
        }
        return roots;
    };

    let baseline = null;

    // Snapshot every object reachable from the global object through
    // prototypes and property descriptors. Object.prototype goes first so
    // verify never reads through a tampered one.
    const seal = () => {
        if (baseline !== null) return;
        const seen = new SetCtor();
        const queue = [Object.prototype, globalThis];
        const extra = hiddenRoots();
        for (let i = 0; i < extra.length; i++) queue[queue.length] = extra[i];
        const snaps = [];
        const visit = (v) => {
            if (isObjectLike(v) && !apply(setHas, seen, [v])) queue[queue.length] = v;
        };
        for (let q = 0; q < queue.length; q++) {
            const obj = queue[q];
            if (apply(setHas, seen, [obj])) continue;
            apply(setAdd, seen, [obj]);
            const keys = ownKeys(obj);
            const descriptors = [];
            for (let i = 0; i < keys.length; i++) {
                const d = record(getOwnPropertyDescriptor(obj, keys[i]));
                descriptors[i] = d;
                visit(d.value);
                visit(d.get);
                visit(d.set);
            }
            const proto = getPrototypeOf(obj);
            visit(proto);
            snaps[snaps.length] = {
                __proto__: null,
                obj,
                proto,
                extensible: isExtensible(obj),
                keys,
                descriptors,
            };
        }
        baseline = snaps;
    };

    const verify = () => {
        let clean = baseline !== null
            && liveTimers === 0
            && state.pendingHostCalls === 0
            && !state.usedAsync;
        if (clean) {
            for (let i = 0; i < baseline.length; i++) {
                if (!unchanged(baseline[i])) {
                    clean = false;
                    break;
                }
            }
        }
        op_runbox_report_integrity(clean);
    };

    defineProperty(globalThis, "__runbox", {
        value: freeze({ runSync, runAsync, seal, verify }),
        writable: false,
        configurable: false,
        enumerable: false,
    });

    // --- Lockdown ---

    for (const name of DISABLED_GLOBALS) {
        if (!deleteProperty(globalThis, name)) {
            try {
                defineProperty(globalThis, name, { value: undefined });
            } catch (_) {}
        }
    }

    // Sever code generation reachable through the prototype chain.
    defineProperty(Function.prototype, "constructor", {
        value: undefined, configurable: false, writable: false,
    });
    defineProperty(AsyncFunction.prototype, "constructor", {
        value: undefined, configurable: false, writable: false,
    });
    defineProperty(GeneratorFunction.prototype, "constructor", {
        value: undefined, configurable: false, writable: false,
    });
    defineProperty(AsyncGeneratorFunction.prototype, "constructor", {
        value: undefined, configurable: false, writable: false,
    });
})(Deno.core.ops);"#;

/// Build the bootstrap script for the given capability set.
///
/// `disabled_globals` are removed on top of [`DEFAULT_DISABLED_GLOBALS`].
pub fn build_bootstrap(
    capabilities: &CapabilitySet,
    disabled_globals: &[String],
) -> Result<String, serde_json::Error> {
    let decls: Vec<CapabilityDecl<'_>> = capabilities
        .iter()
        .map(|c| CapabilityDecl {
            name: &c.name,
            methods: c.methods(),
        })
        .collect();

    let mut disabled: Vec<&str> = DEFAULT_DISABLED_GLOBALS.to_vec();
    for name in disabled_globals {
        if !disabled.contains(&name.as_str()) {
            disabled.push(name);
        }
    }

    Ok(BOOTSTRAP
        .replace("__CAPABILITIES__", &serde_json::to_string(&decls)?)
        .replace("__DISABLED_GLOBALS__", &serde_json::to_string(&disabled)?))
}
